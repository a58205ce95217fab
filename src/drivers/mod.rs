//! Device drivers consumed by the kernel execution core. The PS/2
//! keyboard is kept only as far as C8's `kbhit`, blocking console
//! reads and `accept()`'s keyboard-driven cancel path need it; the
//! wire-level scancode handling is an external collaborator whose
//! interface (not its fidelity) is in scope here.

pub mod keyboard;

pub fn init() {
    keyboard::init();
    crate::log_info!("Drivers subsystem initialized.");
}
