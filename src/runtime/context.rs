//! Thread-local registration of the current message loop.
//!
//! At most one [`MessageLoop`] is current per thread. The slot holds a weak
//! reference, so the registry never keeps a loop alive; the loop registers
//! itself on construction and clears the slot when dropped.

use crate::error::LoopError;
use crate::runtime::MessageLoop;

use std::cell::RefCell;
use std::rc::{Rc, Weak};

thread_local! {
    /// The loop owned by this thread, if any.
    static CURRENT_LOOP: RefCell<Option<Weak<MessageLoop>>> = const { RefCell::new(None) };
}

/// Returns the message loop registered on this thread.
pub(crate) fn current() -> Option<Rc<MessageLoop>> {
    CURRENT_LOOP.with(|current| current.borrow().as_ref().and_then(Weak::upgrade))
}

/// Makes `message_loop` the current loop of this thread.
///
/// Fails if a live loop is already registered.
pub(crate) fn register(message_loop: &Rc<MessageLoop>) -> Result<(), LoopError> {
    CURRENT_LOOP.with(|current| {
        let mut current = current.borrow_mut();

        if current.as_ref().is_some_and(|registered| registered.strong_count() > 0) {
            return Err(LoopError::AlreadyRegistered);
        }

        *current = Some(Rc::downgrade(message_loop));
        Ok(())
    })
}

/// Clears the slot if it still refers to `message_loop`.
pub(crate) fn unregister(message_loop: *const MessageLoop) {
    // Thread-local storage may already be gone during thread teardown.
    let _ = CURRENT_LOOP.try_with(|current| {
        let mut current = current.borrow_mut();

        if current
            .as_ref()
            .is_some_and(|registered| std::ptr::eq(registered.as_ptr(), message_loop))
        {
            *current = None;
        }
    });
}
