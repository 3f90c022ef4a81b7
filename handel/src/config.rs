// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::Arc;
use std::time::Duration;

use tracing::{Span, info_span};

use crate::bitset::{BitSetFactory, FieldBitSet};
use crate::blacklist::{BlackListStrategy, NoopBlackList};
use crate::crypto::{Constructor, PublicKeyOf};
use crate::error::{HandelError, Result};
use crate::identity::Registry;
use crate::partitioner::{BinomialPartitioner, Partitioner};
use crate::processing::{AcceptAllEvaluator, SigEvaluator, StoreEvaluator};
use crate::store::SignatureStore;
use crate::timeout::{
    DEFAULT_LEVEL_TIMEOUT, InfiniteTimeout, LevelStarter, LinearTimeout, TimeoutStrategy,
};

pub const DEFAULT_CONTRIBUTIONS_PERC: usize = 51;
pub const DEFAULT_UPDATE_PERIOD: Duration = Duration::from_millis(20);
pub const DEFAULT_UPDATE_COUNT: usize = 1;
pub const DEFAULT_CANDIDATE_COUNT: usize = 10;

/// Builds the partitioner of a node from its id and the registry.
pub type PartitionerFactory<C> = Arc<
    dyn Fn(i32, Arc<dyn Registry<PublicKeyOf<C>>>, &Span) -> Result<Arc<dyn Partitioner<C>>>
        + Send
        + Sync,
>;

/// Builds the evaluator ranking signatures waiting for verification.
pub type EvaluatorFactory<C> =
    Arc<dyn Fn(Arc<dyn SignatureStore<C>>) -> Box<dyn SigEvaluator<C>> + Send + Sync>;

/// Builds the timeout strategy from the engine hook and the max level.
pub type TimeoutFactory =
    Arc<dyn Fn(Arc<dyn LevelStarter>, usize) -> Box<dyn TimeoutStrategy> + Send + Sync>;

/// Parameters of a Handel node.
pub struct Config<C: Constructor> {
    /// Minimum percentage of contributions a final signature must hold to be
    /// published.
    pub contributions_perc: usize,
    /// Period of the loop re-sending the current aggregates to new peers.
    pub update_period: Duration,
    /// Number of peers contacted per level at each update.
    pub update_count: usize,
    /// Number of peers contacted when a level starts or completes.
    pub candidate_count: usize,
    pub new_bitset: BitSetFactory,
    pub new_partitioner: PartitionerFactory<C>,
    pub new_evaluator_strategy: EvaluatorFactory<C>,
    pub new_timeout_strategy: TimeoutFactory,
    pub black_list: Arc<dyn BlackListStrategy>,
    /// Parent span of every event logged by the node.
    pub span: Span,
}

impl<C: Constructor> Clone for Config<C> {
    fn clone(&self) -> Self {
        Self {
            contributions_perc: self.contributions_perc,
            update_period: self.update_period,
            update_count: self.update_count,
            candidate_count: self.candidate_count,
            new_bitset: self.new_bitset.clone(),
            new_partitioner: self.new_partitioner.clone(),
            new_evaluator_strategy: self.new_evaluator_strategy.clone(),
            new_timeout_strategy: self.new_timeout_strategy.clone(),
            black_list: self.black_list.clone(),
            span: self.span.clone(),
        }
    }
}

impl<C: Constructor> Default for Config<C> {
    fn default() -> Self {
        Self {
            contributions_perc: DEFAULT_CONTRIBUTIONS_PERC,
            update_period: DEFAULT_UPDATE_PERIOD,
            update_count: DEFAULT_UPDATE_COUNT,
            candidate_count: DEFAULT_CANDIDATE_COUNT,
            new_bitset: FieldBitSet::factory(),
            new_partitioner: Arc::new(
                |id: i32, reg: Arc<dyn Registry<PublicKeyOf<C>>>, span: &Span| {
                    Ok(Arc::new(BinomialPartitioner::<C>::new(id, reg, span)?)
                        as Arc<dyn Partitioner<C>>)
                },
            ),
            new_evaluator_strategy: store_evaluator_factory(),
            new_timeout_strategy: linear_timeout_factory(DEFAULT_LEVEL_TIMEOUT),
            black_list: Arc::new(NoopBlackList::default()),
            span: info_span!("handel"),
        }
    }
}

impl<C: Constructor> Config<C> {
    pub fn validate(&self) -> Result<()> {
        if self.contributions_perc == 0 || self.contributions_perc > 100 {
            return Err(HandelError::InvalidConfig(
                format!(
                    "contributions percentage must be in (0, 100], got {}",
                    self.contributions_perc
                )
                .into(),
            ));
        }
        if self.candidate_count == 0 {
            return Err(HandelError::InvalidConfig("candidate count must be positive".into()));
        }
        if self.update_count == 0 {
            return Err(HandelError::InvalidConfig("update count must be positive".into()));
        }
        if self.update_period.is_zero() {
            return Err(HandelError::InvalidConfig("update period must be positive".into()));
        }
        Ok(())
    }

    /// Number of contributions out of `n` needed to publish a signature.
    pub fn threshold(&self, n: usize) -> usize {
        (n * self.contributions_perc).div_ceil(100)
    }
}

/// Partitioner picking peers in a seeded random order, see
/// [`BinomialPartitioner::new_random`].
pub fn random_partitioner_factory<C: Constructor>(seed: Option<[u8; 32]>) -> PartitionerFactory<C> {
    Arc::new(
        move |id: i32, reg: Arc<dyn Registry<PublicKeyOf<C>>>, span: &Span| {
            Ok(Arc::new(BinomialPartitioner::<C>::new_random(id, reg, seed, span)?)
                as Arc<dyn Partitioner<C>>)
        },
    )
}

pub fn store_evaluator_factory<C: Constructor>() -> EvaluatorFactory<C> {
    Arc::new(|store: Arc<dyn SignatureStore<C>>| {
        Box::new(StoreEvaluator::new(store)) as Box<dyn SigEvaluator<C>>
    })
}

pub fn accept_all_evaluator_factory<C: Constructor>() -> EvaluatorFactory<C> {
    Arc::new(|_: Arc<dyn SignatureStore<C>>| {
        Box::new(AcceptAllEvaluator) as Box<dyn SigEvaluator<C>>
    })
}

pub fn linear_timeout_factory(period: Duration) -> TimeoutFactory {
    Arc::new(move |starter: Arc<dyn LevelStarter>, max_level: usize| {
        Box::new(LinearTimeout::new(starter, max_level, period)) as Box<dyn TimeoutStrategy>
    })
}

pub fn infinite_timeout_factory() -> TimeoutFactory {
    Arc::new(|_: Arc<dyn LevelStarter>, _: usize| {
        Box::new(InfiniteTimeout) as Box<dyn TimeoutStrategy>
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeConstructor;

    #[test]
    fn test_default_config() {
        let config = Config::<FakeConstructor>::default();
        assert_eq!(config.contributions_perc, 51);
        assert_eq!(config.update_period, Duration::from_millis(20));
        assert_eq!(config.update_count, 1);
        assert_eq!(config.candidate_count, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_threshold() {
        let mut config = Config::<FakeConstructor>::default();
        for (n, expected) in [(8, 5), (16, 9), (17, 9), (1, 1), (100, 51)] {
            assert_eq!(config.threshold(n), expected, "n = {n}");
        }
        config.contributions_perc = 100;
        assert_eq!(config.threshold(33), 33);
    }

    #[test]
    fn test_validate() {
        let invalid: [fn(&mut Config<FakeConstructor>); 5] = [
            |c| c.contributions_perc = 0,
            |c| c.contributions_perc = 101,
            |c| c.candidate_count = 0,
            |c| c.update_count = 0,
            |c| c.update_period = Duration::ZERO,
        ];
        for (i, tweak) in invalid.iter().enumerate() {
            let mut config = Config::default();
            tweak(&mut config);
            assert!(
                matches!(config.validate(), Err(HandelError::InvalidConfig(_))),
                "case {i}"
            );
        }
    }
}
