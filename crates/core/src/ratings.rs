//! Record types and wiring for the ratings job: count ratings per user and
//! report the users with the most ratings.

use std::iter::{once, Once};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::combine::Sum;
use crate::config::PipelineConfig;
use crate::error::ConfigError;
use crate::executor::Executor;
use crate::format::{JsonFormatter, Layout};
use crate::metrics::Metrics;
use crate::pipeline::{Pipeline, PipelineBuilder};
use crate::topk::RankedEntry;
use crate::transform::Transform;

pub type UserId = u64;
pub type MovieId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rating {
    pub user_id: UserId,
    pub movie_id: MovieId,
    pub rating: f64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRatings {
    pub user_id: UserId,
    pub ratings: i64,
}

impl UserRatings {
    pub fn from_entry(entry: &RankedEntry<UserId, i64>) -> Self {
        Self { user_id: entry.aggregate.key, ratings: entry.aggregate.total }
    }
}

/// Every rating counts once toward its user.
#[derive(Debug, Clone, Copy, Default)]
pub struct RatingsPerUser;

impl Transform<Rating> for RatingsPerUser {
    type Output = (UserId, i64);
    type Outputs = Once<(UserId, i64)>;

    fn apply(&self, input: &Rating) -> Self::Outputs {
        once((input.user_id, 1))
    }
}

pub type TopRaters<E> = Pipeline<Rating, UserId, RatingsPerUser, Sum<i64>, E>;

pub type UserRatingsFormatter = JsonFormatter<fn(&RankedEntry<UserId, i64>) -> UserRatings>;

pub fn top_raters<E: Executor>(
    config: &PipelineConfig,
    executor: E,
    metrics: Arc<dyn Metrics>,
) -> Result<TopRaters<E>, ConfigError> {
    PipelineBuilder::new(config.clone(), executor)
        .extractor(RatingsPerUser)
        .combine(Sum::new(config.overflow))
        .metrics(metrics)
        .build()
}

pub fn user_ratings_formatter(layout: Layout) -> UserRatingsFormatter {
    JsonFormatter::new(layout, UserRatings::from_entry as fn(&RankedEntry<UserId, i64>) -> UserRatings)
}
