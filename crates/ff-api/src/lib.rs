#![forbid(unsafe_code)]

use tracing::{debug, warn};

pub use ff_aggregation::{
    CompositeKeyCombiner, DpBoundedSumReducer, GroupByAggregator, GroupingAggregator,
    GroupingReducer, MergeSignature, OneDimGroupingAggregator, SumReducer, TensorAggregator,
    grouping_sum_output_type,
};
pub use ff_checkpoint::{CHECKPOINT_MAGIC, CheckpointBuilder, CheckpointParser};
pub use ff_core::{
    AggregationError, DataType, ErrorCode, Intrinsic, Tensor, TensorData, TensorShape, TensorSpec,
    TypeKind,
};
pub use ff_registry::{
    AggregatorFactory, DP_GROUPING_SUM_URI, FEDSQL_URI_PREFIX, GROUP_BY_URI, GROUPING_SUM_URI,
    create_aggregator, get_aggregator_factory, parse_aggregation_config,
};

/// Drives one aggregator through its lifecycle with checkpoint-encoded
/// contributions: create from an intrinsic, accumulate one checkpoint per
/// client, optionally merge peer sessions, then report a result
/// checkpoint. The session is single-owner, like the aggregator it wraps.
pub struct AggregationSession {
    aggregator: Box<dyn TensorAggregator>,
    input_names: Vec<String>,
    output_names: Vec<String>,
}

impl std::fmt::Debug for AggregationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregationSession")
            .field("input_names", &self.input_names)
            .field("output_names", &self.output_names)
            .finish()
    }
}

impl AggregationSession {
    pub fn create(intrinsic: &Intrinsic) -> Result<Self, AggregationError> {
        let aggregator = create_aggregator(intrinsic)?;
        let input_names = collect_input_names(intrinsic)?;
        let output_names = collect_output_names(intrinsic)?;
        debug!(
            uri = %intrinsic.uri,
            inputs = input_names.len(),
            outputs = output_names.len(),
            "created aggregation session"
        );
        Ok(Self {
            aggregator,
            input_names,
            output_names,
        })
    }

    /// Folds one client checkpoint. The named input columns are pulled
    /// from the checkpoint in spec order; a client's whole contribution
    /// must arrive in a single checkpoint so contribution bounding sees
    /// it at once.
    pub fn accumulate_checkpoint(&mut self, bytes: &[u8]) -> Result<(), AggregationError> {
        let mut parser = CheckpointParser::parse(bytes)?;
        let tensors = self
            .input_names
            .iter()
            .map(|name| parser.take_tensor(name))
            .collect::<Result<Vec<_>, _>>()?;
        let refs: Vec<&Tensor> = tensors.iter().collect();
        let result = self.aggregator.accumulate(&refs);
        match &result {
            Ok(()) => debug!(num_inputs = self.aggregator.num_inputs(), "accumulated contribution"),
            Err(error) => warn!(error = %error, "contribution rejected"),
        }
        result
    }

    /// Folds another session's partial state, consuming it.
    pub fn merge(&mut self, other: AggregationSession) -> Result<(), AggregationError> {
        let merged_inputs = other.aggregator.num_inputs();
        self.aggregator.merge_with(other.aggregator)?;
        debug!(merged_inputs, num_inputs = self.aggregator.num_inputs(), "merged peer session");
        Ok(())
    }

    #[must_use]
    pub fn can_report(&self) -> bool {
        self.aggregator.can_report()
    }

    #[must_use]
    pub fn num_inputs(&self) -> u64 {
        self.aggregator.num_inputs()
    }

    /// Consumes the session and serializes the aggregate as a checkpoint,
    /// with output names taken from the intrinsic's output specs in
    /// order.
    pub fn report(mut self) -> Result<Vec<u8>, AggregationError> {
        let outputs = self.aggregator.report()?;
        if outputs.len() != self.output_names.len() {
            return Err(AggregationError::internal(format!(
                "aggregator produced {} output tensors but the intrinsic declares {}",
                outputs.len(),
                self.output_names.len()
            )));
        }
        let mut builder = CheckpointBuilder::new();
        for (name, tensor) in self.output_names.iter().zip(outputs.iter()) {
            builder.add(name, tensor)?;
        }
        debug!(outputs = outputs.len(), "reported aggregate checkpoint");
        Ok(builder.build())
    }
}

/// The flat contribution column names: the intrinsic's own inputs
/// followed by each nested intrinsic's inputs. Every one must be named
/// to be addressable in a client checkpoint.
fn collect_input_names(intrinsic: &Intrinsic) -> Result<Vec<String>, AggregationError> {
    let mut names = Vec::new();
    for spec in intrinsic
        .inputs
        .iter()
        .chain(intrinsic.nested_intrinsics.iter().flat_map(|nested| nested.inputs.iter()))
    {
        if spec.is_anonymous() {
            return Err(AggregationError::invalid_argument(
                "anonymous input columns cannot be read from a checkpoint",
            ));
        }
        names.push(spec.name().to_string());
    }
    Ok(names)
}

/// The report column names: the intrinsic's named outputs (anonymous key
/// columns are dropped from reports) followed by each nested intrinsic's
/// outputs, which must all be named.
fn collect_output_names(intrinsic: &Intrinsic) -> Result<Vec<String>, AggregationError> {
    let mut names: Vec<String> = intrinsic
        .outputs
        .iter()
        .filter(|spec| !spec.is_anonymous())
        .map(|spec| spec.name().to_string())
        .collect();
    for nested in &intrinsic.nested_intrinsics {
        for spec in &nested.outputs {
            if spec.is_anonymous() {
                return Err(AggregationError::invalid_argument(
                    "anonymous value outputs cannot be written to a checkpoint",
                ));
            }
            names.push(spec.name().to_string());
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use ff_core::{DataType, ErrorCode, Intrinsic, TensorShape, TensorSpec};

    use super::{AggregationSession, GROUP_BY_URI, GROUPING_SUM_URI};

    fn column_spec(name: &str, dtype: DataType) -> TensorSpec {
        TensorSpec::new(name, dtype, TensorShape::unknown_vector())
    }

    fn group_by_sum_intrinsic(output_key_name: &str) -> Intrinsic {
        Intrinsic::new(
            GROUP_BY_URI,
            vec![column_spec("key", DataType::String)],
            vec![column_spec(output_key_name, DataType::String)],
            Vec::new(),
            vec![Intrinsic::new(
                GROUPING_SUM_URI,
                vec![column_spec("value", DataType::Int32)],
                vec![column_spec("value_sum", DataType::Int64)],
                Vec::new(),
                Vec::new(),
            )],
        )
    }

    #[test]
    fn session_flattens_input_and_output_names() {
        let session = AggregationSession::create(&group_by_sum_intrinsic("key"))
            .expect("session should create");
        assert_eq!(session.input_names, vec!["key", "value"]);
        assert_eq!(session.output_names, vec!["key", "value_sum"]);
    }

    #[test]
    fn session_drops_anonymous_output_keys_from_names() {
        let session = AggregationSession::create(&group_by_sum_intrinsic(""))
            .expect("session should create");
        assert_eq!(session.output_names, vec!["value_sum"]);
    }

    #[test]
    fn session_rejects_anonymous_input_columns() {
        let mut intrinsic = group_by_sum_intrinsic("key");
        intrinsic.inputs[0] = column_spec("", DataType::String);
        intrinsic.outputs[0] = column_spec("", DataType::String);
        let err = AggregationSession::create(&intrinsic)
            .expect_err("anonymous inputs must be rejected");
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
        assert!(err.message().contains("anonymous input"));
    }
}
