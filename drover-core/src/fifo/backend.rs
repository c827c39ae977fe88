use async_trait::async_trait;

use crate::error::Result;

use super::{ItemId, ItemUpdate, ManyQuery, Mode, RawItem, ScoreRange};

/// Storage contract for one named score-ordered queue.
///
/// Every item is either live (visible to pops and peeks) or held in the
/// queue's holding area after a protective pop. Implementations must make each
/// call atomic with respect to other processes using the same store: two
/// concurrent pops never return the same item.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Queue name; backends sharing a store are partitioned by it.
    fn name(&self) -> &str;

    /// Live item count.
    async fn size(&self) -> Result<usize>;

    /// Insert with a backend-allocated id. Allocated ids never collide with a
    /// stored id.
    async fn insert(&self, payload: Vec<u8>, score: f64) -> Result<ItemId>;

    /// Insert-or-ignore under a caller id; `false` when the id is taken.
    async fn insert_by_id(&self, id: ItemId, payload: Vec<u8>, score: f64) -> Result<bool>;

    /// Remove the lowest (`First`) or highest (`Last`) scored live item.
    /// `protective` moves it to the holding area instead of deleting it.
    async fn pop(&self, mode: Mode, protective: bool) -> Result<Option<RawItem>>;

    /// Bulk pop. With `query.temporary` the selection is made from the holding
    /// area; a protective pop from there leaves the items held.
    async fn pop_many(&self, query: &ManyQuery) -> Result<Vec<RawItem>>;

    async fn peek(&self, mode: Mode, skip_item: bool) -> Result<Option<RawItem>>;

    async fn peek_by_id(
        &self,
        id: ItemId,
        temporary: bool,
        skip_item: bool,
    ) -> Result<Option<RawItem>>;

    async fn peek_many(
        &self,
        mode: Mode,
        range: ScoreRange,
        count: Option<usize>,
        skip_item: bool,
    ) -> Result<Vec<RawItem>>;

    /// Delete held items; returns how many were actually removed.
    async fn delete(&self, ids: &[ItemId]) -> Result<usize>;

    /// Return held items (all of them for `None`) to the live queue.
    async fn restore(&self, ids: Option<&[ItemId]>) -> Result<usize>;

    /// Apply `update` to one item, live or held. When a score is supplied the
    /// write happens only if `update.condition` accepts it against the stored
    /// score. Returns whether a row changed.
    async fn update(&self, id: ItemId, update: ItemUpdate) -> Result<bool>;

    async fn clear(&self) -> Result<()>;
}
