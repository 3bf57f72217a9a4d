use serde::{Deserialize, Serialize};

use crate::{error::BuilderError, ContestId, RankingKey};

/// Output of one ranking build: an opaque snapshot plus rendered pages in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltRanking {
    pub snapshot: Vec<u8>,
    pub pages: Vec<String>,
}

/// Computes a ranking from current contest data.
///
/// Implemented once per contest discipline (ACM, PA divisions, quizzes, ...).
/// Must not touch the engine's own state; it only reads underlying results.
pub trait RankingBuilder: Send + Sync {
    fn build(&self, contest_id: &ContestId, key: &RankingKey) -> Result<BuiltRanking, BuilderError>;
}

impl<F> RankingBuilder for F
where
    F: Fn(&ContestId, &RankingKey) -> Result<BuiltRanking, BuilderError> + Send + Sync,
{
    fn build(&self, contest_id: &ContestId, key: &RankingKey) -> Result<BuiltRanking, BuilderError> {
        self(contest_id, key)
    }
}
