pub mod errors;
pub mod events;
pub mod groups;
pub mod ids;
pub mod model;
pub mod registry;
pub mod world;

pub use errors::{ControlError, ControlResult};
pub use events::ControlEvent;
pub use groups::GroupManager;
pub use ids::{GroupId, ParticipantId};
pub use model::{
    GroupCreate, GroupState, GroupSummary, GroupView, Participant, PlayerWorldState,
};
pub use registry::{SessionRegistry, SHORT_ID_QUARANTINE};
pub use world::{WorldCache, WorldSnapshot};
