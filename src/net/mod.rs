//! TCP collaborator stub (C10): a condvar-signalled socket state
//! machine backing the `socket`/`bind`/`listen`/`accept`/`send`/`recv`
//! syscalls. No wire format — this only models the state transitions a
//! real network stack would drive from the outside.

pub mod tcp;
