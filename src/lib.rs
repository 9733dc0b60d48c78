//! Paylock - Escrow Engine
//!
//! The custody core of a payment platform for machine-to-machine
//! service transactions. An escrow locks a buyer's funds when a service
//! interaction starts and settles them exactly once: released to the
//! seller on confirmation, refunded to the buyer through arbitration,
//! or auto-released after a timeout.
//!
//! ## Architecture
//!
//! Control flow for a mutating request:
//!
//! 1. HTTP handler ([`http`]) binds the request and the caller address.
//! 2. The service ([`escrow`] / [`multistep`]) acquires the per-id
//!    mutex, re-reads the record, and runs the policy gates.
//! 3. The ledger ([`ledger`]) moves funds, idempotently keyed by
//!    `(operation, reference)`.
//! 4. The store ([`storage`]) persists the transition.
//! 5. Observers ([`events`]) are notified fire-and-forget.
//!
//! The background sweeper ([`timer`]) drives the same service paths for
//! escrows past their auto-release time and arbitrations past their
//! deadline.
//!
//! ## Fund safety
//!
//! The ledger and store are coordinated so that every failure leaves
//! the system recoverable: pre-ledger failures change nothing,
//! compensatable failures are compensated, and the one uncompensatable
//! path (record update failing after a ledger release) is logged at
//! `CRITICAL:` and reported as a [`errors::EscrowError::Money`] with
//! `released_to_seller`.
//!
//! ## Modules
//!
//! - [`amount`]  - fixed-point money (6 fractional digits).
//! - [`types`]   - escrow and pipeline records, statuses, evidence.
//! - [`errors`]  - the error kinds and the fund-safety wrapper.
//! - [`config`]  - engine tunables and duration parsing.
//! - [`ledger`]  - fund-movement trait + in-memory implementation.
//! - [`storage`] - store traits + in-memory implementations.
//! - [`escrow`]  - the single-party state machine service.
//! - [`multistep`] - N-step pipeline escrow service.
//! - [`timer`]   - the auto-release sweeper.
//! - [`events`]  - transition events and bundled observers.
//! - [`http`]    - the REST surface.

pub mod amount;
pub mod config;
pub mod errors;
pub mod escrow;
pub mod events;
pub mod http;
pub mod ledger;
pub mod multistep;
pub mod storage;
pub mod timer;
pub mod types;

pub use amount::Amount;
pub use config::EngineConfig;
pub use errors::{EscrowError, FundsStatus, LedgerError, StoreError};
pub use escrow::{CreateEscrowRequest, EscrowService};
pub use events::{EscrowEvent, EscrowObserver, ObserverSet};
pub use ledger::{AgentBalance, InMemoryLedger, Ledger};
pub use multistep::{LockStepsRequest, MultiStepService};
pub use storage::{EscrowStore, InMemoryEscrowStore, InMemoryMultiStepStore, MultiStepStore};
pub use timer::{AutoReleaseTimer, TimerHandle};
pub use types::{
    Escrow, EscrowStatus, EvidenceEntry, MultiStepEscrow, MultiStepStatus, PlannedStep,
    Resolution, StepRecord,
};
