//! Round-and-period BFT application engine.
//!
//! Assembles the collaborators `round-abci-types` defines into a
//! running replica: a replicated [`state_db::StateDB`], the
//! [`round`] kernel and its templates, the statically-checked
//! [`app::AbciApp`] executor, and the ABCI-facing [`period_driver::PeriodDriver`].

pub mod app;
pub mod period_driver;
pub mod period_state;
pub mod round;
pub mod state_db;
pub mod static_check;
pub mod timeouts;

pub use app::{AbciApp, AbciAppBuilder, AbciAppDescriptor};
pub use period_driver::{Phase, PeriodDriver};
pub use period_state::PeriodState;
pub use round::{Round, RoundId, EventName};
pub use state_db::StateDB;
pub use timeouts::{TimeoutHandle, Timeouts};
