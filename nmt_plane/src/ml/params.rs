use std::{
    collections::{BTreeMap, HashMap},
    fs::File,
    io::{BufReader, BufWriter},
    path::Path,
};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::ml::{norm, Linear};

/// Name of a layer instance, used as the prefix of all its flat parameter names.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LayerId(String);

impl LayerId {
    pub fn new<T: Into<String>>(name: T) -> Self {
        Self(name.into())
    }

    /// Layer with no prefix, e.g. the source embedding tables.
    pub fn root() -> Self {
        Self(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Derives the id of a stacked layer, `encoder` at level 2 becomes `encoder_2`.
    pub fn level(&self, level: usize) -> Self {
        if level <= 1 {
            self.clone()
        } else {
            Self(format!("{}_{level}", self.0))
        }
    }
}

impl std::fmt::Display for LayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which projection of a layer a parameter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Projection {
    Dense,
    InputGates,
    InputCandidate,
    RecurrentGates { depth: usize },
    RecurrentCandidate { depth: usize },
    TransitionGates { level: usize },
    TransitionCandidate { level: usize },
    ContextGates,
    ContextCandidate,
    AttentionState { source: Option<u8> },
    AttentionContext { source: Option<u8> },
    AttentionScore { source: Option<u8> },
}

impl Projection {
    fn weight_name(&self) -> String {
        match self {
            Projection::Dense => "W".to_string(),
            Projection::InputGates => "W".to_string(),
            Projection::InputCandidate => "Wx".to_string(),
            Projection::RecurrentGates { depth } => format!("U{}", deep_suffix(*depth)),
            Projection::RecurrentCandidate { depth } => format!("Ux{}", deep_suffix(*depth)),
            Projection::TransitionGates { level } => format!("U_nl{}", deep_suffix(*level)),
            Projection::TransitionCandidate { level } => format!("Ux_nl{}", deep_suffix(*level)),
            Projection::ContextGates => "Wc".to_string(),
            Projection::ContextCandidate => "Wcx".to_string(),
            Projection::AttentionState { source } => format!("W_comb_att{}", source_tag(source)),
            Projection::AttentionContext { source } => format!("Wc{}_att", source_tag(source)),
            Projection::AttentionScore { source } => format!("U{}_att", source_tag(source)),
        }
    }

    fn bias_name(&self) -> String {
        match self {
            Projection::Dense | Projection::InputGates => "b".to_string(),
            Projection::InputCandidate => "bx".to_string(),
            Projection::RecurrentGates { depth } => format!("b{}", deep_suffix(*depth)),
            Projection::RecurrentCandidate { depth } => format!("bx{}", deep_suffix(*depth)),
            Projection::TransitionGates { level } => format!("b_nl{}", deep_suffix(*level)),
            Projection::TransitionCandidate { level } => format!("bx_nl{}", deep_suffix(*level)),
            Projection::ContextGates => "bc".to_string(),
            Projection::ContextCandidate => "bcx".to_string(),
            Projection::AttentionState { source } => format!("b_comb{}_att", source_tag(source)),
            Projection::AttentionContext { source } => format!("b{}_att", source_tag(source)),
            Projection::AttentionScore { source } => format!("c{}_tt", source_tag(source)),
        }
    }
}

fn deep_suffix(depth: usize) -> String {
    if depth == 0 {
        String::new()
    } else {
        format!("_drt_{depth}")
    }
}

fn source_tag(source: &Option<u8>) -> String {
    source.map(|x| x.to_string()).unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ParamRole {
    Weight(Projection),
    Bias(Projection),
    LayerNormShift(Projection),
    LayerNormScale(Projection),
    WeightNormScale(Projection),
    Embedding { factor: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParamKey {
    pub layer: LayerId,
    pub role: ParamRole,
}

impl ParamKey {
    pub fn new(layer: &LayerId, role: ParamRole) -> Self {
        Self {
            layer: layer.clone(),
            role,
        }
    }

    /// Flat persistence name, e.g. `decoder_U_nl_drt_1_lns` or `Wemb_dec`.
    pub fn flat_name(&self) -> String {
        let role = match &self.role {
            ParamRole::Weight(p) => p.weight_name(),
            ParamRole::Bias(p) => p.bias_name(),
            // dense layers predate the `W_ln*` naming
            ParamRole::LayerNormShift(Projection::Dense) => "ln_b".to_string(),
            ParamRole::LayerNormScale(Projection::Dense) => "ln_s".to_string(),
            ParamRole::LayerNormShift(p) => format!("{}_lnb", p.weight_name()),
            ParamRole::LayerNormScale(p) => format!("{}_lns", p.weight_name()),
            ParamRole::WeightNormScale(p) => format!("{}_wns", p.weight_name()),
            ParamRole::Embedding { factor } => {
                let table = match factor {
                    0 => "Wemb".to_string(),
                    n => format!("Wemb{n}"),
                };
                return if self.layer.is_root() {
                    table
                } else {
                    format!("{table}_{}", self.layer)
                };
            }
        };

        if self.layer.is_root() {
            role
        } else {
            format!("{}_{role}", self.layer)
        }
    }
}

impl std::fmt::Display for ParamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.flat_name())
    }
}

/// All tensors of a model, keyed by layer and role.
///
/// Shapes are fixed at insertion; values may be overwritten in place by an external optimizer
/// or by [`ParameterSet::load_flat`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSet {
    params: BTreeMap<ParamKey, Linear>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: ParamKey, value: Linear) -> Result<()> {
        if self.params.contains_key(&key) {
            return Err(anyhow!("parameter '{key}' is already initialized"));
        }
        self.params.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: &ParamKey) -> Result<&Linear> {
        self.params
            .get(key)
            .with_context(|| format!("missing parameter '{key}'"))
    }

    pub fn get_mut(&mut self, key: &ParamKey) -> Result<&mut Linear> {
        self.params
            .get_mut(key)
            .with_context(|| format!("missing parameter '{key}'"))
    }

    pub fn contains(&self, key: &ParamKey) -> bool {
        self.params.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ParamKey, &Linear)> {
        self.params.iter()
    }

    pub fn scalar_count(&self) -> usize {
        self.params.values().map(|x| x.count() * x.stride()).sum()
    }

    pub fn scope<'a>(&'a self, layer: &'a LayerId) -> ParamScope<'a> {
        ParamScope {
            params: self,
            layer,
            layer_norm: false,
            weight_norm: false,
        }
    }

    pub fn to_flat(&self) -> Result<BTreeMap<String, Linear>> {
        let mut flat = BTreeMap::new();
        for (key, value) in &self.params {
            let name = key.flat_name();
            if flat.insert(name.clone(), value.clone()).is_some() {
                return Err(anyhow!("flat parameter name '{name}' is ambiguous"));
            }
        }
        Ok(flat)
    }

    /// Overwrites every parameter from a flat mapping.
    ///
    /// The mapping must name exactly the parameters of this set with matching shapes.
    pub fn load_flat(&mut self, mut flat: BTreeMap<String, Linear>) -> Result<()> {
        let names: HashMap<String, ParamKey> = self
            .params
            .keys()
            .map(|key| (key.flat_name(), key.clone()))
            .collect();

        for (name, key) in &names {
            let value = flat
                .remove(name)
                .with_context(|| format!("parameter '{name}' missing from flat mapping"))?;
            let target = self.get_mut(key)?;
            if target.shape() != value.shape() {
                return Err(anyhow!(
                    "parameter '{name}' has shape {:?}, expected {:?}",
                    value.shape(),
                    target.shape()
                ));
            }
            *target = value;
        }

        if let Some(unknown) = flat.keys().next() {
            return Err(anyhow!("unknown parameter '{unknown}' in flat mapping"));
        }
        Ok(())
    }

    #[instrument(level = "info", skip(self))]
    pub fn save_json<P: AsRef<Path> + std::fmt::Debug>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref())
            .with_context(|| format!("failed to create {:?}", path.as_ref()))?;
        let flat = self.to_flat()?;
        serde_json::to_writer(BufWriter::new(file), &flat)?;
        debug!(count = flat.len(), "saved parameters");
        Ok(())
    }

    /// Loads a flat JSON file into a set already initialized with the expected keys.
    #[instrument(level = "info", skip(self))]
    pub fn load_json<P: AsRef<Path> + std::fmt::Debug>(&mut self, path: P) -> Result<()> {
        let file = File::open(path.as_ref())
            .with_context(|| format!("failed to open {:?}", path.as_ref()))?;
        let flat: BTreeMap<String, Linear> = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("invalid parameter file {:?}", path.as_ref()))?;
        self.load_flat(flat)
    }
}

/// Read access to one layer's parameters, resolving normalization flags.
#[derive(Clone, Copy)]
pub struct ParamScope<'a> {
    params: &'a ParameterSet,
    layer: &'a LayerId,
    layer_norm: bool,
    weight_norm: bool,
}

impl<'a> ParamScope<'a> {
    pub fn with_normalisation(self, layer_norm: bool, weight_norm: bool) -> Self {
        Self {
            layer_norm,
            weight_norm,
            ..self
        }
    }

    pub fn get(&self, role: ParamRole) -> Result<&'a Linear> {
        self.params.get(&ParamKey::new(self.layer, role))
    }

    /// Weight matrix, reparametrized by its `_wns` scale when weight norm is on.
    pub fn weight(&self, projection: Projection) -> Result<Linear> {
        let weights = self.get(ParamRole::Weight(projection))?;
        if self.weight_norm {
            let scale = self.get(ParamRole::WeightNormScale(projection))?;
            norm::weight_norm(weights, scale)
        } else {
            Ok(weights.clone())
        }
    }

    pub fn bias(&self, projection: Projection) -> Result<Linear> {
        Ok(self.get(ParamRole::Bias(projection))?.clone())
    }

    pub fn layer_norm(&self, projection: Projection) -> Result<Option<norm::LayerNormalization>> {
        if !self.layer_norm {
            return Ok(None);
        }
        let shift = self.get(ParamRole::LayerNormShift(projection))?;
        let scale = self.get(ParamRole::LayerNormScale(projection))?;
        Ok(Some(norm::LayerNormalization::new(
            shift.clone(),
            scale.clone(),
        )?))
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn flat_names_follow_layer_prefix_and_role() {
        let decoder = LayerId::new("decoder");
        let key = |role| ParamKey::new(&decoder, role).flat_name();

        assert_eq!(key(ParamRole::Weight(Projection::InputGates)), "decoder_W");
        assert_eq!(
            key(ParamRole::Weight(Projection::RecurrentGates { depth: 2 })),
            "decoder_U_drt_2"
        );
        assert_eq!(
            key(ParamRole::LayerNormScale(Projection::TransitionGates { level: 1 })),
            "decoder_U_nl_drt_1_lns"
        );
        assert_eq!(
            key(ParamRole::WeightNormScale(Projection::AttentionContext { source: Some(2) })),
            "decoder_Wc2_att_wns"
        );
        assert_eq!(
            key(ParamRole::Bias(Projection::AttentionScore { source: None })),
            "decoder_c_tt"
        );

        let ff = LayerId::new("ff_state");
        assert_eq!(
            ParamKey::new(&ff, ParamRole::LayerNormShift(Projection::Dense)).flat_name(),
            "ff_state_ln_b"
        );
        assert_eq!(
            ParamKey::new(&LayerId::root(), ParamRole::Embedding { factor: 1 }).flat_name(),
            "Wemb1"
        );
        assert_eq!(
            ParamKey::new(&LayerId::new("dec"), ParamRole::Embedding { factor: 0 }).flat_name(),
            "Wemb_dec"
        );
    }

    #[test]
    fn parameter_set_round_trips_through_flat_mapping() {
        let layer = LayerId::new("encoder");
        let mut params = ParameterSet::new();
        let w_key = ParamKey::new(&layer, ParamRole::Weight(Projection::InputGates));
        let b_key = ParamKey::new(&layer, ParamRole::Bias(Projection::InputGates));
        params.insert(w_key.clone(), Linear::with_value(2, 4, 0.5)).unwrap();
        params.insert(b_key.clone(), Linear::new(1, 4)).unwrap();

        let flat = params.to_flat().unwrap();
        assert_eq!(flat.len(), 2);
        assert!(flat.contains_key("encoder_W"));

        let mut restored = params.clone();
        restored.get_mut(&w_key).unwrap().zero();
        restored.load_flat(flat).unwrap();
        assert_eq!(restored, params);
    }

    #[test]
    fn load_flat_rejects_missing_unknown_and_misshaped() {
        let layer = LayerId::new("ff");
        let mut params = ParameterSet::new();
        let key = ParamKey::new(&layer, ParamRole::Weight(Projection::Dense));
        params.insert(key, Linear::new(2, 2)).unwrap();

        assert!(params.clone().load_flat(BTreeMap::new()).is_err());

        let mut flat = params.to_flat().unwrap();
        flat.insert("ff_extra".to_string(), Linear::new(1, 1));
        assert!(params.clone().load_flat(flat).is_err());

        let mut flat = BTreeMap::new();
        flat.insert("ff_W".to_string(), Linear::new(3, 2));
        assert!(params.load_flat(flat).is_err());
    }

    #[test]
    fn insert_rejects_duplicates_and_get_reports_name() {
        let layer = LayerId::new("gru");
        let key = ParamKey::new(&layer, ParamRole::Weight(Projection::InputCandidate));
        let mut params = ParameterSet::new();
        params.insert(key.clone(), Linear::new(1, 1)).unwrap();

        assert!(params.insert(key, Linear::new(1, 1)).is_err());

        let missing = ParamKey::new(&layer, ParamRole::Weight(Projection::Dense));
        let err = params.get(&missing).unwrap_err();
        assert!(err.to_string().contains("gru_W"));
    }

    #[test]
    fn parameter_set_can_be_saved_and_loaded() {
        let layer = LayerId::new("ff_logit");
        let key = ParamKey::new(&layer, ParamRole::Weight(Projection::Dense));
        let mut params = ParameterSet::new();
        params.insert(key.clone(), Linear::with_value(2, 3, 0.25)).unwrap();

        let path = std::env::temp_dir().join(format!("params-{}.json", std::process::id()));
        params.save_json(&path).unwrap();

        let mut restored = params.clone();
        restored.get_mut(&key).unwrap().zero();
        restored.load_json(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(restored, params);
    }
}
