use std::collections::HashMap;
use std::sync::Arc;

use rankd_core::{BuilderError, BuiltRanking, ContestId, RankingBuilder, RankingKey};

/// Routes each contest to the builder of its scoring discipline.
#[derive(Default, Clone)]
pub struct Disciplines {
    by_contest: HashMap<ContestId, Arc<dyn RankingBuilder>>,
    fallback: Option<Arc<dyn RankingBuilder>>,
}

impl Disciplines {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder for contests without an explicit registration.
    pub fn with_default(builder: Arc<dyn RankingBuilder>) -> Self {
        Self { by_contest: HashMap::new(), fallback: Some(builder) }
    }

    pub fn register(&mut self, contest: ContestId, builder: Arc<dyn RankingBuilder>) -> &mut Self {
        self.by_contest.insert(contest, builder);
        self
    }

    pub fn route(&self, contest: &ContestId) -> Option<&Arc<dyn RankingBuilder>> {
        self.by_contest.get(contest).or(self.fallback.as_ref())
    }
}

impl RankingBuilder for Disciplines {
    fn build(&self, contest_id: &ContestId, key: &RankingKey) -> Result<BuiltRanking, BuilderError> {
        match self.route(contest_id) {
            Some(b) => b.build(contest_id, key),
            None => Err(BuilderError::NoBuilder(contest_id.to_string())),
        }
    }
}
