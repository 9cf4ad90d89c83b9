//! Registry of per-NIC stacks, looked up by interface index or MAC.
//!
//! A plain value threaded through the program, not a process-wide
//! singleton: whoever owns the registry owns every stack.

use std::rc::Rc;

use crate::addr::MacAddr;
use crate::error::{Error, Result};
use crate::inet::Inet;
use crate::nic::Nic;
use crate::timer::Timers;

struct Entry {
    index: usize,
    subindex: usize,
    inet: Inet,
}

/// All stacks of this image.
pub struct SuperStack {
    stacks: Vec<Entry>,
}

impl SuperStack {
    pub fn new() -> Self {
        SuperStack { stacks: Vec::new() }
    }

    /// Assemble a stack on `nic` and register it under `(index, subindex)`.
    pub fn create(
        &mut self,
        nic: Rc<dyn Nic>,
        index: usize,
        subindex: usize,
        timers: Timers,
    ) -> Result<Inet> {
        if self.lookup(index, subindex).is_some() {
            return Err(Error::InvalidState("stack index already in use"));
        }
        let inet = Inet::new(nic, timers)?;
        self.stacks.push(Entry {
            index,
            subindex,
            inet: inet.clone(),
        });
        Ok(inet)
    }

    /// The stack for NIC `index` (subindex 0).
    pub fn get(&self, index: usize) -> Option<Inet> {
        self.lookup(index, 0)
    }

    pub fn get_sub(&self, index: usize, subindex: usize) -> Option<Inet> {
        self.lookup(index, subindex)
    }

    /// The stack whose NIC carries `mac`.
    pub fn get_by_mac(&self, mac: MacAddr) -> Option<Inet> {
        self.stacks
            .iter()
            .find(|e| e.inet.link_addr() == mac)
            .map(|e| e.inet.clone())
    }

    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    fn lookup(&self, index: usize, subindex: usize) -> Option<Inet> {
        self.stacks
            .iter()
            .find(|e| e.index == index && e.subindex == subindex)
            .map(|e| e.inet.clone())
    }
}

impl Default for SuperStack {
    fn default() -> Self {
        Self::new()
    }
}
