// Process-wide coordination state.
//
// All mutable realtime state (presence, rooms, whiteboards, pending saves,
// platform counters) is owned by one Coordinator constructed at startup and
// passed explicitly to the transport binding layer. No module-level
// singletons.

use crate::debounce::SaveQueue;
use crate::presence::PresenceRegistry;
use crate::rooms::RoomHub;
use crate::stats::StatsAggregator;
use crate::store::SessionStore;
use crate::whiteboard::WhiteboardStore;

#[derive(Clone)]
pub struct Coordinator {
    pub store: SessionStore,
    pub presence: PresenceRegistry,
    pub rooms: RoomHub,
    pub whiteboards: WhiteboardStore,
    pub saves: SaveQueue,
    pub stats: StatsAggregator,
}

impl Coordinator {
    pub fn new(store: SessionStore, stats: StatsAggregator) -> Self {
        Self {
            store,
            presence: PresenceRegistry::default(),
            rooms: RoomHub::default(),
            whiteboards: WhiteboardStore::default(),
            saves: SaveQueue::default(),
            stats,
        }
    }
}
