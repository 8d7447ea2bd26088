#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::marker::PhantomData;

use ff_core::{
    AggregationError, DataType, NumericValue, Tensor, TensorData, TensorShape, TensorSpec,
    WideningCast,
};

/// Structural identity of an aggregator, used to decide whether two
/// instances may merge. Replaces a runtime downcast: two aggregators are
/// merge-compatible iff their signatures are equal.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeSignature {
    pub uri: String,
    pub input_specs: Vec<TensorSpec>,
    pub output_specs: Vec<TensorSpec>,
    pub nested: Vec<MergeSignature>,
}

impl MergeSignature {
    #[must_use]
    pub fn leaf(
        uri: impl Into<String>,
        input_specs: Vec<TensorSpec>,
        output_specs: Vec<TensorSpec>,
    ) -> Self {
        Self {
            uri: uri.into(),
            input_specs,
            output_specs,
            nested: Vec::new(),
        }
    }
}

/// The aggregator protocol: `accumulate* | merge*` in any interleaving,
/// then a single consuming `report`. Every operation after the output has
/// been taken fails `FailedPrecondition`.
pub trait TensorAggregator: std::fmt::Debug {
    fn merge_signature(&self) -> MergeSignature;

    /// Folds one client contribution.
    fn accumulate(&mut self, tensors: &[&Tensor]) -> Result<(), AggregationError>;

    /// Folds another aggregator's partial state, consuming it.
    fn merge_with(&mut self, other: Box<dyn TensorAggregator>) -> Result<(), AggregationError>;

    fn can_report(&self) -> bool;

    fn num_inputs(&self) -> u64;

    /// Takes the raw internal outputs (for group-by this includes
    /// anonymous key columns). Consumes the aggregator state.
    fn take_outputs(&mut self) -> Result<Vec<Tensor>, AggregationError>;

    /// Takes the reportable outputs. Consumes the aggregator state.
    fn report(&mut self) -> Result<Vec<Tensor>, AggregationError> {
        self.take_outputs()
    }
}

/// Aggregators that reduce `(ordinals, values)` pairs and can therefore
/// be nested under a group-by, which translates ordinals before merging.
pub trait GroupingAggregator: TensorAggregator {
    /// Merges pre-accumulated partial values at the given ordinals.
    /// `num_inputs` is the number of contributions folded into the peer
    /// state being merged.
    fn merge_tensors(
        &mut self,
        tensors: &[&Tensor],
        num_inputs: u64,
    ) -> Result<(), AggregationError>;
}

/// The (input, output) dtype widening table shared by the grouping sum
/// family. Everything outside the table is rejected up front.
pub fn grouping_sum_output_type(input: DataType) -> Result<DataType, AggregationError> {
    match input {
        DataType::Int32 | DataType::Int64 => Ok(DataType::Int64),
        DataType::Float | DataType::Double => Ok(DataType::Double),
        other => Err(AggregationError::invalid_argument(format!(
            "Unsupported input type {other} for grouping sum"
        ))),
    }
}

/// Maps tuples of per-row key values to dense ordinals. Rows are interned
/// by their byte encoding; per-column storage stays transposed so output
/// keys materialize as a direct move.
pub struct CompositeKeyCombiner {
    key_types: Vec<DataType>,
    intern: HashMap<Vec<u8>, u64>,
    columns: Vec<TensorData>,
}

impl CompositeKeyCombiner {
    #[must_use]
    pub fn new(key_types: Vec<DataType>) -> Self {
        let columns = key_types
            .iter()
            .map(|&dtype| TensorData::empty(dtype))
            .collect();
        Self {
            key_types,
            intern: HashMap::new(),
            columns,
        }
    }

    #[must_use]
    pub fn key_types(&self) -> &[DataType] {
        &self.key_types
    }

    /// Number of distinct composite keys seen so far.
    #[must_use]
    pub fn num_keys(&self) -> usize {
        self.intern.len()
    }

    /// Assigns an ordinal to every row of the key tensors and returns the
    /// `Int64` ordinal tensor with the input key shape. All validation
    /// happens before the first mutation.
    pub fn accumulate(&mut self, keys: &[&Tensor]) -> Result<Tensor, AggregationError> {
        if keys.len() != self.key_types.len() {
            return Err(AggregationError::invalid_argument(format!(
                "CompositeKeyCombiner::accumulate: expected {} key tensors but got {}",
                self.key_types.len(),
                keys.len()
            )));
        }
        let shape = keys
            .first()
            .map(|t| t.shape().clone())
            .unwrap_or_else(TensorShape::scalar);
        if shape.dim_sizes().len() > 1 {
            return Err(AggregationError::invalid_argument(
                "CompositeKeyCombiner::accumulate: only scalar or one-dimensional \
                 key tensors are supported",
            ));
        }
        for (index, (tensor, &expected)) in keys.iter().zip(self.key_types.iter()).enumerate() {
            if tensor.dtype() != expected {
                return Err(AggregationError::invalid_argument(format!(
                    "CompositeKeyCombiner::accumulate: key tensor {index} has dtype {} \
                     but the key schema expects {expected}",
                    tensor.dtype()
                )));
            }
            if tensor.shape() != &shape {
                return Err(AggregationError::invalid_argument(
                    "CompositeKeyCombiner::accumulate: all key tensors must share one shape",
                ));
            }
            if !tensor.is_dense() {
                return Err(AggregationError::invalid_argument(
                    "CompositeKeyCombiner::accumulate: only dense tensors are supported",
                ));
            }
        }

        let num_rows = keys.first().map_or(0, |t| t.num_elements());
        let mut ordinals = Vec::with_capacity(num_rows);
        let mut row_bytes = Vec::new();
        for row in 0..num_rows {
            encode_row(keys, row, &mut row_bytes);
            let ordinal = match self.intern.get(&row_bytes) {
                Some(&ordinal) => ordinal,
                None => {
                    let ordinal = self.intern.len() as u64;
                    for (column, tensor) in self.columns.iter_mut().zip(keys.iter()) {
                        push_row_value(column, tensor, row);
                    }
                    self.intern.insert(row_bytes.clone(), ordinal);
                    ordinal
                }
            };
            ordinals.push(ordinal as i64);
        }
        Tensor::create(DataType::Int64, shape, TensorData::I64(ordinals))
    }

    /// Materializes every key column as a dense tensor of length K,
    /// moving the column storage out to the caller.
    pub fn take_output_keys(&mut self) -> Result<Vec<Tensor>, AggregationError> {
        let num_keys = self.intern.len() as i64;
        let columns = std::mem::take(&mut self.columns);
        self.intern.clear();
        columns
            .into_iter()
            .map(|column| {
                Tensor::create(column.dtype(), TensorShape::vector(num_keys), column)
            })
            .collect()
    }
}

fn encode_row(keys: &[&Tensor], row: usize, buf: &mut Vec<u8>) {
    buf.clear();
    for tensor in keys {
        match tensor.data() {
            TensorData::I32(v) => buf.extend_from_slice(&v[row].to_le_bytes()),
            TensorData::I64(v) => buf.extend_from_slice(&v[row].to_le_bytes()),
            TensorData::F32(v) => buf.extend_from_slice(&v[row].to_bits().to_le_bytes()),
            TensorData::F64(v) => buf.extend_from_slice(&v[row].to_bits().to_le_bytes()),
            TensorData::Str(v) => {
                buf.extend_from_slice(&(v[row].len() as u64).to_le_bytes());
                buf.extend_from_slice(v[row].as_bytes());
            }
        }
    }
}

fn push_row_value(column: &mut TensorData, tensor: &Tensor, row: usize) {
    match column {
        TensorData::I32(col) => col.push(tensor.as_slice::<i32>()[row]),
        TensorData::I64(col) => col.push(tensor.as_slice::<i64>()[row]),
        TensorData::F32(col) => col.push(tensor.as_slice::<f32>()[row]),
        TensorData::F64(col) => col.push(tensor.as_slice::<f64>()[row]),
        TensorData::Str(col) => col.push(tensor.as_slice::<String>()[row].clone()),
    }
}

/// Batch reduction strategy for a one-dimensional grouping aggregator.
/// The whole batch is handed over in one call so the per-value hot loop
/// never crosses a dispatch boundary.
pub trait GroupingReducer<I, O>
where
    I: NumericValue,
    O: NumericValue,
{
    /// Value used to pad the accumulator when new ordinals appear.
    fn default_value(&self) -> O;

    /// Folds one client's raw `(ordinals, values)` batch into `data`.
    /// `data` has already been resized past the largest ordinal.
    fn accumulate_batch(&self, data: &mut [O], ordinals: &[i64], values: &[I]);

    /// Folds pre-bounded partial sums; bounds are never reapplied here.
    fn merge_batch(&self, data: &mut [O], ordinals: &[i64], values: &[O]) {
        for (&ordinal, &value) in ordinals.iter().zip(values.iter()) {
            data[ordinal as usize] += value;
        }
    }
}

/// Plain grouping sum: pointwise widening `+=`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SumReducer;

impl<I, O> GroupingReducer<I, O> for SumReducer
where
    I: NumericValue + WideningCast<O>,
    O: NumericValue,
{
    fn default_value(&self) -> O {
        O::ZERO
    }

    fn accumulate_batch(&self, data: &mut [O], ordinals: &[i64], values: &[I]) {
        for (&ordinal, &value) in ordinals.iter().zip(values.iter()) {
            data[ordinal as usize] += value.widen();
        }
    }
}

/// Differentially-private grouping sum with per-client contribution
/// bounding. A bound below zero is not enforced.
///
/// Accumulation first aggregates the batch into the client's dense local
/// contribution vector, clamps each cell to the L-infinity bound, rescales
/// by `min(1, l1_bound/L1, l2_bound/L2)` with a zero norm skipping its
/// term, and only then folds into the accumulator. When the rescale factor
/// is exactly one the fold takes the exact widening path, so loose bounds
/// reproduce the plain sum bit-for-bit on integer dtypes.
#[derive(Debug, Clone, Copy)]
pub struct DpBoundedSumReducer<I> {
    linfinity_bound: I,
    l1_bound: f64,
    l2_bound: f64,
}

impl<I: NumericValue> DpBoundedSumReducer<I> {
    #[must_use]
    pub fn new(linfinity_bound: I, l1_bound: f64, l2_bound: f64) -> Self {
        Self {
            linfinity_bound,
            l1_bound,
            l2_bound,
        }
    }
}

impl<I, O> GroupingReducer<I, O> for DpBoundedSumReducer<I>
where
    I: NumericValue + WideningCast<O>,
    O: NumericValue,
{
    fn default_value(&self) -> O {
        O::ZERO
    }

    fn accumulate_batch(&self, data: &mut [O], ordinals: &[i64], values: &[I]) {
        let mut local_len = 0usize;
        for &ordinal in ordinals {
            local_len = local_len.max(ordinal as usize + 1);
        }
        let mut local = vec![I::ZERO; local_len];
        for (&ordinal, &value) in ordinals.iter().zip(values.iter()) {
            local[ordinal as usize] += value;
        }

        if self.linfinity_bound >= I::ZERO {
            let upper = self.linfinity_bound;
            let lower = -self.linfinity_bound;
            for cell in &mut local {
                if *cell > upper {
                    *cell = upper;
                } else if *cell < lower {
                    *cell = lower;
                }
            }
        }

        let mut l1 = 0.0f64;
        let mut l2_squared = 0.0f64;
        for &cell in &local {
            let v = cell.to_f64();
            l1 += v.abs();
            l2_squared += v * v;
        }
        let l2 = l2_squared.sqrt();

        // A zero norm skips its term so all-zero contributions never
        // divide by zero.
        let mut scale = 1.0f64;
        if self.l1_bound >= 0.0 && l1 > 0.0 {
            scale = scale.min(self.l1_bound / l1);
        }
        if self.l2_bound >= 0.0 && l2 > 0.0 {
            scale = scale.min(self.l2_bound / l2);
        }

        if scale >= 1.0 {
            for (ordinal, &cell) in local.iter().enumerate() {
                data[ordinal] += cell.widen();
            }
        } else {
            for (ordinal, &cell) in local.iter().enumerate() {
                data[ordinal] += O::from_f64(cell.to_f64() * scale);
            }
        }
    }
}

/// Per-ordinal reduction over exactly two input tensors, `ordinals:
/// Int64` and `values`, both dense with identical shape of at most one
/// dimension. The accumulator grows lazily, padded with the reducer's
/// default value. Not thread safe; callers shard across instances and
/// fold with `merge_with`.
pub struct OneDimGroupingAggregator<I, O, R>
where
    I: NumericValue,
    O: NumericValue,
    R: GroupingReducer<I, O>,
{
    signature: MergeSignature,
    reducer: R,
    data: Option<Vec<O>>,
    num_inputs: u64,
    _input: PhantomData<I>,
}

impl<I, O, R> OneDimGroupingAggregator<I, O, R>
where
    I: NumericValue,
    O: NumericValue,
    R: GroupingReducer<I, O>,
{
    #[must_use]
    pub fn new(signature: MergeSignature, reducer: R) -> Self {
        Self {
            signature,
            reducer,
            data: Some(Vec::new()),
            num_inputs: 0,
            _input: PhantomData,
        }
    }

    fn consumed_error() -> AggregationError {
        AggregationError::failed_precondition(
            "OneDimGroupingAggregator: output has already been consumed",
        )
    }

    fn validate_tensor_inputs(tensors: &[&Tensor]) -> Result<(), AggregationError> {
        assert!(
            tensors.len() == 2,
            "OneDimGroupingAggregator operates on exactly 2 input tensors, got {}",
            tensors.len()
        );
        let ordinals = tensors[0];
        let values = tensors[1];
        if ordinals.dtype() != DataType::Int64 {
            return Err(AggregationError::invalid_argument(format!(
                "OneDimGroupingAggregator: dtype mismatch for tensor 0, expected Int64 \
                 but got {}",
                ordinals.dtype()
            )));
        }
        if ordinals.shape() != values.shape() {
            return Err(AggregationError::invalid_argument(
                "OneDimGroupingAggregator: shape of both tensors must be the same",
            ));
        }
        if values.shape().dim_sizes().len() > 1 {
            return Err(AggregationError::invalid_argument(format!(
                "OneDimGroupingAggregator: only tensors of at most one dimension are \
                 supported, input tensor has {} dimensions",
                values.shape().dim_sizes().len()
            )));
        }
        if !ordinals.is_dense() || !values.is_dense() {
            return Err(AggregationError::invalid_argument(
                "OneDimGroupingAggregator: only dense tensors are supported",
            ));
        }
        if ordinals.as_slice::<i64>().iter().any(|&o| o < 0) {
            return Err(AggregationError::invalid_argument(
                "OneDimGroupingAggregator: ordinals must be non-negative",
            ));
        }
        Ok(())
    }

    fn resize_for(data: &mut Vec<O>, ordinals: &[i64], default: O) {
        let mut required = data.len();
        for &ordinal in ordinals {
            required = required.max(ordinal as usize + 1);
        }
        // Resize once per batch to avoid quadratic growth.
        if required > data.len() {
            data.resize(required, default);
        }
    }
}

impl<I, O, R> std::fmt::Debug for OneDimGroupingAggregator<I, O, R>
where
    I: NumericValue,
    O: NumericValue,
    R: GroupingReducer<I, O>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OneDimGroupingAggregator")
            .field("signature", &self.signature)
            .field("num_inputs", &self.num_inputs)
            .finish()
    }
}

impl<I, O, R> TensorAggregator for OneDimGroupingAggregator<I, O, R>
where
    I: NumericValue,
    O: NumericValue,
    R: GroupingReducer<I, O>,
{
    fn merge_signature(&self) -> MergeSignature {
        self.signature.clone()
    }

    fn accumulate(&mut self, tensors: &[&Tensor]) -> Result<(), AggregationError> {
        let Some(data) = self.data.as_mut() else {
            return Err(Self::consumed_error());
        };
        Self::validate_tensor_inputs(tensors)?;
        let values = tensors[1];
        if values.dtype() != I::DATA_TYPE {
            return Err(AggregationError::invalid_argument(format!(
                "OneDimGroupingAggregator::accumulate: dtype mismatch for tensor 1, \
                 expected {} but got {}",
                I::DATA_TYPE,
                values.dtype()
            )));
        }
        let ordinals = tensors[0].as_slice::<i64>();
        Self::resize_for(data, ordinals, self.reducer.default_value());
        self.reducer
            .accumulate_batch(data, ordinals, values.as_slice::<I>());
        self.num_inputs += 1;
        Ok(())
    }

    fn merge_with(&mut self, mut other: Box<dyn TensorAggregator>) -> Result<(), AggregationError> {
        if self.data.is_none() {
            return Err(Self::consumed_error());
        }
        if other.merge_signature() != self.signature {
            return Err(AggregationError::invalid_argument(
                "OneDimGroupingAggregator::merge_with: can only merge with an \
                 aggregator of the same structure",
            ));
        }
        let peer_inputs = other.num_inputs();
        let mut outputs = other.take_outputs()?;
        let values = outputs
            .pop()
            .filter(|_| outputs.is_empty())
            .ok_or_else(|| {
                AggregationError::internal(
                    "OneDimGroupingAggregator::merge_with: peer produced an unexpected \
                     number of output tensors",
                )
            })?;
        let len = values.num_elements() as i64;
        let ordinals = Tensor::create(
            DataType::Int64,
            TensorShape::vector(len),
            TensorData::I64((0..len).collect()),
        )?;
        self.merge_tensors(&[&ordinals, &values], peer_inputs)
    }

    fn can_report(&self) -> bool {
        self.data.is_some()
    }

    fn num_inputs(&self) -> u64 {
        self.num_inputs
    }

    fn take_outputs(&mut self) -> Result<Vec<Tensor>, AggregationError> {
        let data = self.data.take().ok_or_else(Self::consumed_error)?;
        let len = data.len() as i64;
        Ok(vec![Tensor::create(
            O::DATA_TYPE,
            TensorShape::vector(len),
            O::vec_into_data(data),
        )?])
    }
}

impl<I, O, R> GroupingAggregator for OneDimGroupingAggregator<I, O, R>
where
    I: NumericValue,
    O: NumericValue,
    R: GroupingReducer<I, O>,
{
    fn merge_tensors(
        &mut self,
        tensors: &[&Tensor],
        num_inputs: u64,
    ) -> Result<(), AggregationError> {
        let Some(data) = self.data.as_mut() else {
            return Err(Self::consumed_error());
        };
        Self::validate_tensor_inputs(tensors)?;
        let values = tensors[1];
        if values.dtype() != O::DATA_TYPE {
            return Err(AggregationError::invalid_argument(format!(
                "OneDimGroupingAggregator::merge_tensors: dtype mismatch for tensor 1, \
                 expected {} but got {}",
                O::DATA_TYPE,
                values.dtype()
            )));
        }
        let ordinals = tensors[0].as_slice::<i64>();
        Self::resize_for(data, ordinals, self.reducer.default_value());
        self.reducer
            .merge_batch(data, ordinals, values.as_slice::<O>());
        self.num_inputs += num_inputs;
        Ok(())
    }
}

/// Composes a `CompositeKeyCombiner` with an ordered list of nested
/// grouping aggregators. Each contribution is a flat tensor list: the
/// first K slots are key columns, the remainder value columns grouped by
/// nested aggregator. With no key columns every row falls into a single
/// implicit group and no key outputs are emitted.
pub struct GroupByAggregator {
    uri: String,
    num_inputs: u64,
    consumed: bool,
    key_combiner: Option<CompositeKeyCombiner>,
    input_key_specs: Vec<TensorSpec>,
    output_key_specs: Vec<TensorSpec>,
    nested_signatures: Vec<MergeSignature>,
    aggregators: Vec<Box<dyn GroupingAggregator>>,
    num_tensors_per_input: usize,
}

impl std::fmt::Debug for GroupByAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupByAggregator")
            .field("uri", &self.uri)
            .field("num_inputs", &self.num_inputs)
            .field("consumed", &self.consumed)
            .finish()
    }
}

impl GroupByAggregator {
    /// Most construction invariants are enforced by the factory; these
    /// are backup checks against composer bugs and abort on violation.
    #[must_use]
    pub fn new(
        uri: impl Into<String>,
        input_key_specs: Vec<TensorSpec>,
        output_key_specs: Vec<TensorSpec>,
        aggregators: Vec<Box<dyn GroupingAggregator>>,
    ) -> Self {
        assert!(
            input_key_specs.len() == output_key_specs.len(),
            "GroupByAggregator: size of input_key_specs must match size of output_key_specs"
        );
        for (input, output) in input_key_specs.iter().zip(output_key_specs.iter()) {
            assert!(
                input.dtype() == output.dtype(),
                "GroupByAggregator: input and output key specs must have matching data types"
            );
            assert!(
                input.shape() == &TensorShape::unknown_vector()
                    && output.shape() == &TensorShape::unknown_vector(),
                "GroupByAggregator: key tensors must have one dimension of unknown size"
            );
        }
        let nested_signatures: Vec<MergeSignature> = aggregators
            .iter()
            .map(|aggregator| aggregator.merge_signature())
            .collect();
        let num_value_inputs: usize = nested_signatures
            .iter()
            .map(|signature| signature.input_specs.len())
            .sum();
        let num_tensors_per_input = input_key_specs.len() + num_value_inputs;
        assert!(
            num_tensors_per_input > 0,
            "GroupByAggregator: must operate on a nonzero number of tensors"
        );
        let key_combiner = if input_key_specs.is_empty() {
            None
        } else {
            Some(CompositeKeyCombiner::new(
                input_key_specs.iter().map(TensorSpec::dtype).collect(),
            ))
        };
        Self {
            uri: uri.into(),
            num_inputs: 0,
            consumed: false,
            key_combiner,
            input_key_specs,
            output_key_specs,
            nested_signatures,
            aggregators,
            num_tensors_per_input,
        }
    }

    fn consumed_error() -> AggregationError {
        AggregationError::failed_precondition(
            "GroupByAggregator: output has already been consumed",
        )
    }

    fn check_valid(&self) -> Result<(), AggregationError> {
        if self.consumed {
            return Err(Self::consumed_error());
        }
        Ok(())
    }

    fn validate_input_tensor(
        tensor: &Tensor,
        input_index: usize,
        expected: &TensorSpec,
        key_shape: &TensorShape,
    ) -> Result<(), AggregationError> {
        if tensor.dtype() != expected.dtype() {
            return Err(AggregationError::invalid_argument(format!(
                "GroupByAggregator: tensor at position {input_index} did not have \
                 expected dtype {} and instead had dtype {}",
                expected.dtype(),
                tensor.dtype()
            )));
        }
        if tensor.shape() != key_shape {
            return Err(AggregationError::invalid_argument(format!(
                "GroupByAggregator: shape of value tensor at index {input_index} does \
                 not match the shape of the first key tensor"
            )));
        }
        if !tensor.is_dense() {
            return Err(AggregationError::invalid_argument(
                "GroupByAggregator: only dense tensors are supported",
            ));
        }
        Ok(())
    }

    /// Validates the full tensor list against the given per-nested specs
    /// without touching any state.
    fn validate_tensors(
        &self,
        tensors: &[&Tensor],
        spec_of: impl Fn(&MergeSignature) -> &[TensorSpec],
    ) -> Result<TensorShape, AggregationError> {
        if tensors.len() != self.num_tensors_per_input {
            return Err(AggregationError::invalid_argument(format!(
                "GroupByAggregator: should operate on {} input tensors but got {}",
                self.num_tensors_per_input,
                tensors.len()
            )));
        }
        // The first tensor's shape defines the row count every column
        // must share; the combiner re-validates the key columns before
        // mutating its own state.
        let key_shape = tensors[0].shape().clone();
        if key_shape.dim_sizes().len() > 1 {
            return Err(AggregationError::invalid_argument(
                "GroupByAggregator: only scalar or one-dimensional tensors are supported",
            ));
        }
        let mut input_index = self.input_key_specs.len();
        for signature in &self.nested_signatures {
            for spec in spec_of(signature) {
                Self::validate_input_tensor(tensors[input_index], input_index, spec, &key_shape)?;
                input_index += 1;
            }
        }
        Ok(key_shape)
    }

    fn create_ordinals(&mut self, tensors: &[&Tensor]) -> Result<Tensor, AggregationError> {
        match self.key_combiner.as_mut() {
            Some(combiner) => {
                let keys: Vec<&Tensor> = tensors[..self.input_key_specs.len()].to_vec();
                combiner.accumulate(&keys)
            }
            // No keys: every row belongs to the single implicit group 0.
            None => Tensor::create(
                DataType::Int64,
                tensors[0].shape().clone(),
                TensorData::I64(vec![0; tensors[0].num_elements()]),
            ),
        }
    }

    fn fan_out<F>(&mut self, tensors: &[&Tensor], ordinals: &Tensor, mut apply: F)
    where
        F: FnMut(&mut Box<dyn GroupingAggregator>, &[&Tensor]) -> Result<(), AggregationError>,
    {
        let mut input_index = self.input_key_specs.len();
        for (aggregator, signature) in self.aggregators.iter_mut().zip(&self.nested_signatures) {
            let mut nested_inputs: Vec<&Tensor> =
                Vec::with_capacity(signature.input_specs.len() + 1);
            nested_inputs.push(ordinals);
            for _ in 0..signature.input_specs.len() {
                nested_inputs.push(tensors[input_index]);
                input_index += 1;
            }
            // The combiner and earlier nested aggregators have already
            // been mutated; a failure here would leave the group-by in an
            // inconsistent state, so it is a composer bug, not a status.
            if let Err(error) = apply(aggregator, &nested_inputs) {
                panic!("GroupByAggregator: nested aggregation failed after state mutation: {error}");
            }
        }
    }

    fn merge_tensors_internal(
        &mut self,
        tensors: &[&Tensor],
        num_merged_inputs: u64,
    ) -> Result<(), AggregationError> {
        self.validate_tensors(tensors, |signature| &signature.output_specs)?;
        let ordinals = self.create_ordinals(tensors)?;
        self.fan_out(tensors, &ordinals, |aggregator, nested_inputs| {
            aggregator.merge_tensors(nested_inputs, num_merged_inputs)
        });
        Ok(())
    }
}

impl TensorAggregator for GroupByAggregator {
    fn merge_signature(&self) -> MergeSignature {
        MergeSignature {
            uri: self.uri.clone(),
            input_specs: self.input_key_specs.clone(),
            output_specs: self.output_key_specs.clone(),
            nested: self.nested_signatures.clone(),
        }
    }

    fn accumulate(&mut self, tensors: &[&Tensor]) -> Result<(), AggregationError> {
        self.check_valid()?;
        self.validate_tensors(tensors, |signature| &signature.input_specs)?;
        let ordinals = self.create_ordinals(tensors)?;
        self.fan_out(tensors, &ordinals, |aggregator, nested_inputs| {
            aggregator.accumulate(nested_inputs)
        });
        self.num_inputs += 1;
        Ok(())
    }

    fn merge_with(&mut self, mut other: Box<dyn TensorAggregator>) -> Result<(), AggregationError> {
        self.check_valid()?;
        if other.merge_signature() != self.merge_signature() {
            return Err(AggregationError::invalid_argument(
                "GroupByAggregator::merge_with: expected the other aggregator to have \
                 the same key specs and nested intrinsics",
            ));
        }
        let peer_inputs = other.num_inputs();
        let peer_outputs = other.take_outputs()?;
        let refs: Vec<&Tensor> = peer_outputs.iter().collect();
        self.merge_tensors_internal(&refs, peer_inputs)?;
        self.num_inputs += peer_inputs;
        Ok(())
    }

    fn can_report(&self) -> bool {
        !self.consumed
    }

    fn num_inputs(&self) -> u64 {
        self.num_inputs
    }

    fn take_outputs(&mut self) -> Result<Vec<Tensor>, AggregationError> {
        self.check_valid()?;
        self.consumed = true;
        let mut outputs = match self.key_combiner.as_mut() {
            Some(combiner) => combiner.take_output_keys()?,
            None => Vec::new(),
        };
        for aggregator in &mut self.aggregators {
            outputs.extend(aggregator.take_outputs()?);
        }
        Ok(outputs)
    }

    fn report(&mut self) -> Result<Vec<Tensor>, AggregationError> {
        let num_keys = self.output_key_specs.len();
        let output_key_specs = self.output_key_specs.clone();
        let internal = self.take_outputs()?;
        // Key columns only reach the report when their output name is
        // nonempty; anonymous columns exist purely for grouping.
        let mut outputs = Vec::with_capacity(internal.len());
        for (index, tensor) in internal.into_iter().enumerate() {
            if index < num_keys && output_key_specs[index].is_anonymous() {
                continue;
            }
            outputs.push(tensor);
        }
        Ok(outputs)
    }
}
