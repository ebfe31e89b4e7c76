use std::{ops::Deref, sync::Arc};

use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::ml::NodeValue;

use self::rc::ArcRNG;

use super::cell::MutexCell;

#[derive(Clone, Serialize, Deserialize)]
pub enum RngStrategy {
    Default,

    Debug {
        seed: u64,
    },

    #[serde(serialize_with = "serialize_cached")]
    #[serde(skip_deserializing)]
    Cached(ArcRNG, Arc<RngStrategy>),
}

impl Default for RngStrategy {
    fn default() -> Self {
        Self::Default.upgrade()
    }
}

impl Deref for RngStrategy {
    type Target = dyn RNG;

    fn deref(&self) -> &Self::Target {
        self
    }
}

impl RNG for RngStrategy {
    fn rand(&self) -> NodeValue {
        self.with_rng(|x| x.rand())
    }

    fn rand_normal(&self) -> NodeValue {
        self.with_rng(|x| x.rand_normal())
    }
}

impl RngStrategy {
    pub fn testable(seed: u64) -> Self {
        RngStrategy::Debug { seed }.upgrade()
    }

    pub fn to_arc(&self) -> Arc<dyn RNG + Send + Sync> {
        match self {
            RngStrategy::Cached(instance, _) => instance.rng.clone(),
            RngStrategy::Default => Arc::new(StdRngSource::from_entropy()),
            RngStrategy::Debug { seed } => Arc::new(StdRngSource::new(*seed)),
        }
    }

    pub fn with_rng<F: Fn(&dyn RNG) -> O, O>(&self, func: F) -> O {
        match self {
            RngStrategy::Cached(instance, _) => func(instance.rng.as_ref()),
            rng => func(rng.to_arc().as_ref()),
        }
    }

    /// Pins the strategy to a single shared generator so consecutive draws advance one stream.
    pub fn upgrade(self) -> Self {
        match self {
            RngStrategy::Cached(instance, strategy) => RngStrategy::Cached(instance, strategy),
            rng => RngStrategy::Cached(rng.to_arc().into(), Arc::new(rng)),
        }
    }

    /// Derives an independent, still deterministic, stream from this one.
    pub fn fork(&self) -> Self {
        if self.is_debug() {
            let seed = (self.rand() * u32::MAX as NodeValue) as u64;
            RngStrategy::testable(seed)
        } else {
            RngStrategy::default()
        }
    }

    /// Returns `true` if the rng strategy is [`Cached`].
    ///
    /// [`Cached`]: RngStrategy::Cached
    #[must_use]
    pub fn is_cached(&self) -> bool {
        matches!(self, Self::Cached(..))
    }

    /// Returns `true` if the rng strategy is [`Debug`].
    ///
    /// [`Debug`]: RngStrategy::Debug
    #[must_use]
    pub fn is_debug(&self) -> bool {
        match self {
            Self::Debug { .. } => true,
            Self::Cached(_, inner) => inner.is_debug(),
            _ => false,
        }
    }
}

fn serialize_cached<S>(
    _: &ArcRNG,
    inner: &Arc<RngStrategy>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let mut inner = inner;
    while let RngStrategy::Cached(_, child) = &**inner {
        inner = child;
    }
    inner.serialize(serializer)
}

impl std::fmt::Debug for RngStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => write!(f, "Default"),
            Self::Debug { seed } => f.debug_struct("Debug").field("seed", seed).finish(),
            Self::Cached(_, inner) => f.debug_struct("Cached").field("inner", inner).finish(),
        }
    }
}

mod rc {
    use std::sync::Arc;

    use super::RNG;

    #[derive(Clone)]
    pub struct ArcRNG {
        pub rng: Arc<dyn RNG + Send + Sync>,
    }

    impl From<Arc<dyn RNG + Send + Sync>> for ArcRNG {
        fn from(value: Arc<dyn RNG + Send + Sync>) -> Self {
            Self { rng: value }
        }
    }
}

pub struct StdRngSource(MutexCell<StdRng>);

impl StdRngSource {
    pub fn new(seed: u64) -> Self {
        Self(MutexCell::new(StdRng::seed_from_u64(seed)))
    }

    pub fn from_entropy() -> Self {
        Self(MutexCell::new(StdRng::from_entropy()))
    }
}

impl RNG for StdRngSource {
    fn rand(&self) -> NodeValue {
        self.0.with_inner(|inner| inner.gen::<NodeValue>())
    }

    fn rand_normal(&self) -> NodeValue {
        self.0.with_inner(|inner| inner.sample::<NodeValue, _>(StandardNormal))
    }
}

pub trait RNG {
    /// uniform sample in `[0, 1)`
    fn rand(&self) -> NodeValue;

    fn rand_range(&self, min: usize, exclusive_max: usize) -> usize {
        (self.rand() * (exclusive_max - min) as NodeValue) as usize + min
    }

    fn rand_normal(&self) -> NodeValue {
        // Box-Muller
        let u1 = self.rand().max(NodeValue::MIN_POSITIVE);
        let u2 = self.rand();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI as NodeValue * u2).cos()
    }

    /// Returns 1.0 with probability `p`, otherwise 0.0.
    fn bernoulli(&self, p: NodeValue) -> NodeValue {
        if self.rand() < p {
            1.0
        } else {
            0.0
        }
    }
}

pub trait ShuffleRng {
    fn shuffle_vec<T>(&self, vec: &mut Vec<T>);
}

impl<T: Deref<Target = dyn RNG>> ShuffleRng for T {
    fn shuffle_vec<E>(&self, vec: &mut Vec<E>) {
        let len = vec.len();

        for i in 0..len {
            let j = self.rand_range(i, len);
            vec.swap(i, j);
        }
    }
}
