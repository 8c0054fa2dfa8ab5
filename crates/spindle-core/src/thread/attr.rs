//! Thread creation attributes.

use crate::error::{Error, Result};
use crate::sys::host;

/// Smallest stack a thread may be given.
pub const STACK_MIN: usize = 16 * 1024;

/// Stack size used when the creator expresses no preference.
pub const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;

/// Whether a new thread can be joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetachState {
    #[default]
    Joinable,
    Detached,
}

/// Contention scope. Only system scope is real on this platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scope {
    #[default]
    System,
    Process,
}

/// Creation-time options for a thread.
///
/// Scheduling fields are carried and reported back but do not influence the
/// host scheduler.
#[derive(Debug, Clone)]
pub struct ThreadAttr {
    stack_base: usize,
    stack_size: usize,
    guard_size: usize,
    detach_state: DetachState,
    sched_policy: i32,
    sched_priority: i32,
}

impl Default for ThreadAttr {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadAttr {
    #[must_use]
    pub fn new() -> Self {
        Self {
            stack_base: 0,
            stack_size: DEFAULT_STACK_SIZE,
            guard_size: host::page_size(),
            detach_state: DetachState::Joinable,
            sched_policy: 0,
            sched_priority: 0,
        }
    }

    #[must_use]
    pub fn stack(&self) -> Option<(usize, usize)> {
        if self.stack_base == 0 { None } else { Some((self.stack_base, self.stack_size)) }
    }

    /// Run the thread on a caller-provided stack.
    ///
    /// The region must stay mapped until the thread is joined.
    pub fn set_stack(&mut self, base: usize, size: usize) -> Result<()> {
        let page = host::page_size();
        if base == 0 || base % page != 0 || size < STACK_MIN {
            return Err(Error::InvalidArgument);
        }
        self.stack_base = base;
        self.stack_size = size;
        Ok(())
    }

    #[must_use]
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn set_stack_size(&mut self, size: usize) -> Result<()> {
        if size < STACK_MIN {
            return Err(Error::InvalidArgument);
        }
        self.stack_size = size;
        Ok(())
    }

    #[must_use]
    pub fn guard_size(&self) -> usize {
        self.guard_size
    }

    pub fn set_guard_size(&mut self, size: usize) -> Result<()> {
        self.guard_size = size;
        Ok(())
    }

    #[must_use]
    pub fn detach_state(&self) -> DetachState {
        self.detach_state
    }

    pub fn set_detach_state(&mut self, state: DetachState) {
        self.detach_state = state;
    }

    #[must_use]
    pub fn scope(&self) -> Scope {
        Scope::System
    }

    pub fn set_scope(&mut self, scope: Scope) -> Result<()> {
        match scope {
            Scope::System => Ok(()),
            Scope::Process => Err(Error::NotSupported),
        }
    }

    #[must_use]
    pub fn sched_policy(&self) -> i32 {
        self.sched_policy
    }

    pub fn set_sched_policy(&mut self, policy: i32) {
        self.sched_policy = policy;
    }

    #[must_use]
    pub fn sched_priority(&self) -> i32 {
        self.sched_priority
    }

    pub fn set_sched_priority(&mut self, priority: i32) {
        self.sched_priority = priority;
    }

    pub(crate) fn set_reported_stack(&mut self, base: usize, size: usize, guard: usize) {
        self.stack_base = base;
        self.stack_size = size;
        self.guard_size = guard;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_joinable_with_a_guarded_stack() {
        let attr = ThreadAttr::new();
        assert_eq!(attr.detach_state(), DetachState::Joinable);
        assert_eq!(attr.stack(), None);
        assert_eq!(attr.stack_size(), DEFAULT_STACK_SIZE);
        assert!(attr.guard_size() > 0);
    }

    #[test]
    fn undersized_stacks_are_rejected() {
        let mut attr = ThreadAttr::new();
        assert_eq!(attr.set_stack_size(STACK_MIN - 1), Err(Error::InvalidArgument));
        attr.set_stack_size(STACK_MIN).unwrap();
        assert_eq!(attr.set_stack(0, STACK_MIN), Err(Error::InvalidArgument));
        assert_eq!(attr.set_stack(host::page_size(), 1), Err(Error::InvalidArgument));
        assert_eq!(attr.set_stack(host::page_size() + 1, STACK_MIN), Err(Error::InvalidArgument));
    }

    #[test]
    fn process_scope_is_unsupported() {
        let mut attr = ThreadAttr::new();
        attr.set_scope(Scope::System).unwrap();
        assert_eq!(attr.set_scope(Scope::Process), Err(Error::NotSupported));
        assert_eq!(attr.scope(), Scope::System);
    }
}
