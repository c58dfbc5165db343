// Core modules: error model, identities, outcomes, pipes, shared memory, and child processes.
pub mod error;
pub mod ident;
pub mod oneshot;
pub mod outcome;
pub mod process;
pub mod shm;
