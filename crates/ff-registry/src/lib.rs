#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::OnceLock;

use ff_aggregation::{
    DpBoundedSumReducer, GroupByAggregator, GroupingAggregator, MergeSignature,
    OneDimGroupingAggregator, SumReducer, TensorAggregator, grouping_sum_output_type,
};
use ff_core::{
    AggregationError, DataType, Intrinsic, Tensor, TensorData, TensorShape, TensorSpec,
};
use serde::Deserialize;

pub const FEDSQL_URI_PREFIX: &str = "GoogleSQL:";
pub const GROUP_BY_URI: &str = "GoogleSQL:group_by";
pub const GROUPING_SUM_URI: &str = "GoogleSQL:sum";
pub const DP_GROUPING_SUM_URI: &str = "GoogleSQL:dp_sum";

pub const CONFIG_SCHEMA_VERSION: u32 = 1;

/// Creates aggregators from intrinsic descriptors. `create_grouping` only
/// succeeds for factories whose aggregators can be nested under a
/// group-by; the default keeps non-grouping aggregators out of that
/// position without any runtime downcast.
pub trait AggregatorFactory: Send + Sync + std::fmt::Debug {
    fn create(&self, intrinsic: &Intrinsic) -> Result<Box<dyn TensorAggregator>, AggregationError>;

    fn create_grouping(
        &self,
        intrinsic: &Intrinsic,
    ) -> Result<Box<dyn GroupingAggregator>, AggregationError> {
        Err(AggregationError::invalid_argument(format!(
            "intrinsic '{}' does not produce a grouping aggregator",
            intrinsic.uri
        )))
    }
}

static REGISTRY: OnceLock<HashMap<&'static str, &'static (dyn AggregatorFactory)>> =
    OnceLock::new();

/// The process-wide factory table. Initialized once on first use; lookups
/// after that are lock-free.
fn registry() -> &'static HashMap<&'static str, &'static (dyn AggregatorFactory)> {
    REGISTRY.get_or_init(|| {
        let mut table: HashMap<&'static str, &'static (dyn AggregatorFactory)> = HashMap::new();
        table.insert(GROUP_BY_URI, &GroupByFactory);
        table.insert(GROUPING_SUM_URI, &GroupingSumFactory);
        table.insert(DP_GROUPING_SUM_URI, &DpGroupingSumFactory);
        table
    })
}

pub fn get_aggregator_factory(
    uri: &str,
) -> Result<&'static dyn AggregatorFactory, AggregationError> {
    registry().get(uri).copied().ok_or_else(|| {
        AggregationError::not_found(format!("unknown intrinsic URI '{uri}'"))
    })
}

/// Resolves the intrinsic URI in the registry and drives its factory.
pub fn create_aggregator(
    intrinsic: &Intrinsic,
) -> Result<Box<dyn TensorAggregator>, AggregationError> {
    get_aggregator_factory(&intrinsic.uri)?.create(intrinsic)
}

fn check_uri(intrinsic: &Intrinsic, expected: &str) -> Result<(), AggregationError> {
    if intrinsic.uri != expected {
        return Err(AggregationError::invalid_argument(format!(
            "expected intrinsic URI '{expected}' but got '{}'",
            intrinsic.uri
        )));
    }
    Ok(())
}

/// Shared validation for the one-dimensional grouping sum family: one
/// input column, one output column, both with a single unknown dimension,
/// and a widening-table-approved dtype pair. No nested intrinsics.
fn check_grouping_sum_intrinsic(
    intrinsic: &Intrinsic,
    uri: &str,
) -> Result<(), AggregationError> {
    check_uri(intrinsic, uri)?;
    if intrinsic.inputs.len() != 1 || intrinsic.outputs.len() != 1 {
        return Err(AggregationError::invalid_argument(format!(
            "intrinsic '{uri}' expects exactly one input and one output tensor but got \
             {} inputs and {} outputs",
            intrinsic.inputs.len(),
            intrinsic.outputs.len()
        )));
    }
    if !intrinsic.nested_intrinsics.is_empty() {
        return Err(AggregationError::invalid_argument(format!(
            "intrinsic '{uri}' does not support nested intrinsics"
        )));
    }
    let input = &intrinsic.inputs[0];
    let output = &intrinsic.outputs[0];
    if input.shape() != &TensorShape::unknown_vector()
        || output.shape() != &TensorShape::unknown_vector()
    {
        return Err(AggregationError::invalid_argument(
            "all input and output tensors must have one dimension of unknown size",
        ));
    }
    let widened = grouping_sum_output_type(input.dtype())?;
    if output.dtype() != widened {
        return Err(AggregationError::invalid_argument(format!(
            "intrinsic '{uri}' must declare output type {widened} for input type {} \
             but declared {}",
            input.dtype(),
            output.dtype()
        )));
    }
    Ok(())
}

fn leaf_signature(intrinsic: &Intrinsic) -> MergeSignature {
    MergeSignature::leaf(
        intrinsic.uri.clone(),
        intrinsic.inputs.clone(),
        intrinsic.outputs.clone(),
    )
}

/// `GoogleSQL:sum` — plain grouping sum over the widening table.
#[derive(Debug)]
pub struct GroupingSumFactory;

impl AggregatorFactory for GroupingSumFactory {
    fn create(&self, intrinsic: &Intrinsic) -> Result<Box<dyn TensorAggregator>, AggregationError> {
        Ok(self.create_grouping(intrinsic)?)
    }

    fn create_grouping(
        &self,
        intrinsic: &Intrinsic,
    ) -> Result<Box<dyn GroupingAggregator>, AggregationError> {
        check_grouping_sum_intrinsic(intrinsic, GROUPING_SUM_URI)?;
        if !intrinsic.parameters.is_empty() {
            return Err(AggregationError::invalid_argument(
                "GroupingSumFactory: no input parameters expected",
            ));
        }
        let signature = leaf_signature(intrinsic);
        Ok(match intrinsic.inputs[0].dtype() {
            DataType::Int32 => Box::new(OneDimGroupingAggregator::<i32, i64, _>::new(
                signature, SumReducer,
            )),
            DataType::Int64 => Box::new(OneDimGroupingAggregator::<i64, i64, _>::new(
                signature, SumReducer,
            )),
            DataType::Float => Box::new(OneDimGroupingAggregator::<f32, f64, _>::new(
                signature, SumReducer,
            )),
            DataType::Double => Box::new(OneDimGroupingAggregator::<f64, f64, _>::new(
                signature, SumReducer,
            )),
            other => {
                return Err(AggregationError::invalid_argument(format!(
                    "Unsupported input type {other} for grouping sum"
                )));
            }
        })
    }
}

/// `GoogleSQL:dp_sum` — grouping sum with per-client contribution
/// bounding. Parameters, in order: `(linfinity_bound, l1_bound,
/// l2_bound)`; the first matches the input dtype, the last two are
/// `Double` scalars. A bound below zero is not enforced.
#[derive(Debug)]
pub struct DpGroupingSumFactory;

impl DpGroupingSumFactory {
    fn check_parameters(intrinsic: &Intrinsic) -> Result<(f64, f64), AggregationError> {
        if intrinsic.parameters.len() != 3 {
            return Err(AggregationError::invalid_argument(format!(
                "DpGroupingSumFactory: expected 3 parameters \
                 (linfinity_bound, l1_bound, l2_bound) but got {}",
                intrinsic.parameters.len()
            )));
        }
        let linfinity = &intrinsic.parameters[0];
        if linfinity.dtype() != intrinsic.inputs[0].dtype() || linfinity.num_elements() != 1 {
            return Err(AggregationError::invalid_argument(
                "DpGroupingSumFactory: linfinity_bound must be a scalar of the input type",
            ));
        }
        for (index, name) in [(1usize, "l1_bound"), (2, "l2_bound")] {
            let bound = &intrinsic.parameters[index];
            if bound.dtype() != DataType::Double || bound.num_elements() != 1 {
                return Err(AggregationError::invalid_argument(format!(
                    "DpGroupingSumFactory: {name} must be a Double scalar"
                )));
            }
        }
        Ok((
            intrinsic.parameters[1].as_scalar::<f64>(),
            intrinsic.parameters[2].as_scalar::<f64>(),
        ))
    }
}

impl AggregatorFactory for DpGroupingSumFactory {
    fn create(&self, intrinsic: &Intrinsic) -> Result<Box<dyn TensorAggregator>, AggregationError> {
        Ok(self.create_grouping(intrinsic)?)
    }

    fn create_grouping(
        &self,
        intrinsic: &Intrinsic,
    ) -> Result<Box<dyn GroupingAggregator>, AggregationError> {
        check_grouping_sum_intrinsic(intrinsic, DP_GROUPING_SUM_URI)?;
        let (l1_bound, l2_bound) = Self::check_parameters(intrinsic)?;
        let signature = leaf_signature(intrinsic);
        let linfinity = &intrinsic.parameters[0];
        Ok(match intrinsic.inputs[0].dtype() {
            DataType::Int32 => Box::new(OneDimGroupingAggregator::<i32, i64, _>::new(
                signature,
                DpBoundedSumReducer::new(linfinity.as_scalar::<i32>(), l1_bound, l2_bound),
            )),
            DataType::Int64 => Box::new(OneDimGroupingAggregator::<i64, i64, _>::new(
                signature,
                DpBoundedSumReducer::new(linfinity.as_scalar::<i64>(), l1_bound, l2_bound),
            )),
            DataType::Float => Box::new(OneDimGroupingAggregator::<f32, f64, _>::new(
                signature,
                DpBoundedSumReducer::new(linfinity.as_scalar::<f32>(), l1_bound, l2_bound),
            )),
            DataType::Double => Box::new(OneDimGroupingAggregator::<f64, f64, _>::new(
                signature,
                DpBoundedSumReducer::new(linfinity.as_scalar::<f64>(), l1_bound, l2_bound),
            )),
            other => {
                return Err(AggregationError::invalid_argument(format!(
                    "Unsupported input type {other} for grouping sum"
                )));
            }
        })
    }
}

/// `GoogleSQL:group_by` — composes a key combiner with nested grouping
/// aggregators created through this same registry.
#[derive(Debug)]
pub struct GroupByFactory;

impl GroupByFactory {
    fn check_intrinsic(intrinsic: &Intrinsic) -> Result<(), AggregationError> {
        check_uri(intrinsic, GROUP_BY_URI)?;
        if intrinsic.inputs.len() != intrinsic.outputs.len() {
            return Err(AggregationError::invalid_argument(format!(
                "GroupByFactory: exactly the same number of input and output key \
                 tensors expected but got {} inputs vs {} outputs",
                intrinsic.inputs.len(),
                intrinsic.outputs.len()
            )));
        }
        for (input, output) in intrinsic.inputs.iter().zip(intrinsic.outputs.iter()) {
            if input.dtype() != output.dtype() {
                return Err(AggregationError::invalid_argument(
                    "GroupByFactory: input and output key tensors have mismatched specs",
                ));
            }
            if input.shape() != &TensorShape::unknown_vector()
                || output.shape() != &TensorShape::unknown_vector()
            {
                return Err(AggregationError::invalid_argument(
                    "all input and output tensors must have one dimension of unknown size",
                ));
            }
        }
        if !intrinsic.parameters.is_empty() {
            return Err(AggregationError::invalid_argument(
                "GroupByFactory: no input parameters expected",
            ));
        }
        Ok(())
    }

    fn create_nested(
        intrinsic: &Intrinsic,
    ) -> Result<Vec<Box<dyn GroupingAggregator>>, AggregationError> {
        let mut nested_aggregators = Vec::with_capacity(intrinsic.nested_intrinsics.len());
        let mut num_value_inputs = 0usize;
        for nested in &intrinsic.nested_intrinsics {
            if !nested.uri.starts_with(FEDSQL_URI_PREFIX) {
                return Err(AggregationError::invalid_argument(format!(
                    "GroupByFactory: nested intrinsic URIs must start with \
                     '{FEDSQL_URI_PREFIX}' but got '{}'",
                    nested.uri
                )));
            }
            let factory = get_aggregator_factory(&nested.uri)?;
            nested_aggregators.push(factory.create_grouping(nested)?);
            num_value_inputs += nested.inputs.len();
        }
        if num_value_inputs + intrinsic.inputs.len() == 0 {
            return Err(AggregationError::invalid_argument(
                "GroupByFactory: must operate on a nonzero number of input tensors",
            ));
        }
        Ok(nested_aggregators)
    }
}

impl AggregatorFactory for GroupByFactory {
    fn create(&self, intrinsic: &Intrinsic) -> Result<Box<dyn TensorAggregator>, AggregationError> {
        Self::check_intrinsic(intrinsic)?;
        let nested_aggregators = Self::create_nested(intrinsic)?;
        Ok(Box::new(GroupByAggregator::new(
            intrinsic.uri.clone(),
            intrinsic.inputs.clone(),
            intrinsic.outputs.clone(),
            nested_aggregators,
        )))
    }
}

// ── aggregation configuration ingestion ──

const MAX_CONFIG_DIAGNOSTIC_LEN: usize = 200;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigDocument {
    schema_version: u32,
    intrinsics: Vec<IntrinsicConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct IntrinsicConfig {
    uri: String,
    #[serde(default)]
    inputs: Vec<SpecConfig>,
    #[serde(default)]
    outputs: Vec<SpecConfig>,
    #[serde(default)]
    parameters: Vec<ParameterConfig>,
    #[serde(default)]
    nested: Vec<IntrinsicConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SpecConfig {
    #[serde(default)]
    name: String,
    dtype: DtypeConfig,
    shape: Vec<i64>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum DtypeConfig {
    Int32,
    Int64,
    Float,
    Double,
    String,
}

impl From<DtypeConfig> for DataType {
    fn from(value: DtypeConfig) -> Self {
        match value {
            DtypeConfig::Int32 => DataType::Int32,
            DtypeConfig::Int64 => DataType::Int64,
            DtypeConfig::Float => DataType::Float,
            DtypeConfig::Double => DataType::Double,
            DtypeConfig::String => DataType::String,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ParameterConfig {
    dtype: DtypeConfig,
    #[serde(default)]
    shape: Vec<i64>,
    values: ParamValues,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ParamValues {
    Ints(Vec<i64>),
    Floats(Vec<f64>),
    Strings(Vec<String>),
}

/// Materializes intrinsic descriptors (including constant parameter
/// tensors) from a JSON aggregation configuration. Strict: unknown fields
/// and schema version drift fail closed.
pub fn parse_aggregation_config(input: &str) -> Result<Vec<Intrinsic>, AggregationError> {
    let document: ConfigDocument = serde_json::from_str(input).map_err(|error| {
        let diagnostic = error.to_string();
        match unknown_field_name(&diagnostic) {
            Some(field) => AggregationError::invalid_argument(format!(
                "aggregation config has unknown field '{field}'"
            )),
            None => AggregationError::invalid_argument(format!(
                "malformed aggregation config: {}",
                truncate_diagnostic(&diagnostic, MAX_CONFIG_DIAGNOSTIC_LEN)
            )),
        }
    })?;
    if document.schema_version != CONFIG_SCHEMA_VERSION {
        return Err(AggregationError::invalid_argument(format!(
            "aggregation config schema version mismatch: expected \
             {CONFIG_SCHEMA_VERSION} found {}",
            document.schema_version
        )));
    }
    document
        .intrinsics
        .into_iter()
        .map(intrinsic_from_config)
        .collect()
}

fn intrinsic_from_config(config: IntrinsicConfig) -> Result<Intrinsic, AggregationError> {
    let parameters = config
        .parameters
        .into_iter()
        .map(parameter_tensor)
        .collect::<Result<Vec<_>, _>>()?;
    let nested = config
        .nested
        .into_iter()
        .map(intrinsic_from_config)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Intrinsic::new(
        config.uri,
        config.inputs.into_iter().map(spec_from_config).collect(),
        config.outputs.into_iter().map(spec_from_config).collect(),
        parameters,
        nested,
    ))
}

fn spec_from_config(config: SpecConfig) -> TensorSpec {
    TensorSpec::new(
        config.name,
        DataType::from(config.dtype),
        TensorShape::new(config.shape),
    )
}

fn parameter_tensor(config: ParameterConfig) -> Result<Tensor, AggregationError> {
    let dtype = DataType::from(config.dtype);
    let data = match (dtype, config.values) {
        (DataType::Int32, ParamValues::Ints(values)) => TensorData::I32(
            values
                .into_iter()
                .map(|v| {
                    i32::try_from(v).map_err(|_| {
                        AggregationError::invalid_argument(format!(
                            "parameter value {v} does not fit in Int32"
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
        ),
        (DataType::Int64, ParamValues::Ints(values)) => TensorData::I64(values),
        (DataType::Float, ParamValues::Ints(values)) => {
            TensorData::F32(values.into_iter().map(|v| v as f32).collect())
        }
        (DataType::Float, ParamValues::Floats(values)) => {
            TensorData::F32(values.into_iter().map(|v| v as f32).collect())
        }
        (DataType::Double, ParamValues::Ints(values)) => {
            TensorData::F64(values.into_iter().map(|v| v as f64).collect())
        }
        (DataType::Double, ParamValues::Floats(values)) => TensorData::F64(values),
        (DataType::String, ParamValues::Strings(values)) => TensorData::Str(values),
        (dtype, _) => {
            return Err(AggregationError::invalid_argument(format!(
                "parameter values do not match declared dtype {dtype}"
            )));
        }
    };
    Tensor::create(dtype, TensorShape::new(config.shape), data)
}

/// Pulls the offending field name out of a `deny_unknown_fields`
/// rejection, which serde_json phrases as ``unknown field `NAME`,
/// expected ...``.
fn unknown_field_name(diagnostic: &str) -> Option<String> {
    let (_, tail) = diagnostic.split_once("unknown field `")?;
    let (field, _) = tail.split_once('`')?;
    Some(field.to_string())
}

/// Caps a decode diagnostic at `limit` bytes, cutting on a char
/// boundary.
fn truncate_diagnostic(diagnostic: &str, limit: usize) -> String {
    if diagnostic.len() <= limit {
        return diagnostic.to_string();
    }
    let mut cut = limit;
    while !diagnostic.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &diagnostic[..cut])
}
