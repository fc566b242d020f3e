pub mod dispatcher;
pub mod events;
pub mod sessions;
pub mod websocket;

pub use dispatcher::{MatchAnnouncer, PushDispatcher};
pub use events::{ClientEvent, MatchFoundPayload, MyRole, ServerEvent};
pub use sessions::{run_heartbeat_worker, SessionRegistry};
