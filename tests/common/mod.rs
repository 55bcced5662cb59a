#![allow(dead_code)]

use msgloop::{MessageLoop, RunLoop};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Runs the current loop until `done` holds or `timeout` passes. Returns
/// the final value of `done`.
pub fn run_until(timeout: Duration, done: impl Fn() -> bool + 'static) -> bool {
    let message_loop = MessageLoop::current().expect("test thread runs a message loop");

    let armed = Arc::new(AtomicBool::new(true));
    let timer = armed.clone();
    message_loop.post_delayed_task(
        move || {
            if timer.load(Ordering::SeqCst)
                && let Some(current) = MessageLoop::current()
            {
                current.quit_now();
            }
        },
        timeout,
    );

    let done = Rc::new(done);
    let check = done.clone();
    message_loop.set_extension_signal_handler(move || {
        if (*check)()
            && let Some(current) = MessageLoop::current()
        {
            current.quit_now();
        }
        false
    });

    RunLoop::new().expect("run loop").run();

    message_loop.clear_extension_signal_handler();
    armed.store(false, Ordering::SeqCst);
    (*done)()
}

pub fn run_until_idle() {
    RunLoop::new().expect("run loop").run_until_idle();
}
