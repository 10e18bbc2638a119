mod session;
mod session_monitor;
mod supervisor;

pub use session::{
    transition_trigger, MonitorPhase, Session, SessionRegistry, StateTransition,
};
pub use session_monitor::{MonitorContext, PollOutcome, SessionMonitor};
pub use supervisor::{DiscoveryReport, MonitorSupervisor, SweepReport};
