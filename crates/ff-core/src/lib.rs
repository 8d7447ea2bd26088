#![forbid(unsafe_code)]

use std::fmt;

pub const UNKNOWN_DIM: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidArgument,
    FailedPrecondition,
    NotFound,
    Unimplemented,
    Internal,
    Unavailable,
}

impl ErrorCode {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid argument",
            Self::FailedPrecondition => "failed precondition",
            Self::NotFound => "not found",
            Self::Unimplemented => "unimplemented",
            Self::Internal => "internal",
            Self::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationError {
    code: ErrorCode,
    message: String,
}

impl AggregationError {
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    #[must_use]
    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::FailedPrecondition, message)
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    #[must_use]
    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unimplemented, message)
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unavailable, message)
    }

    #[must_use]
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for AggregationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.label(), self.message)
    }
}

impl std::error::Error for AggregationError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Invalid,
    Int32,
    Int64,
    Float,
    Double,
    String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Numeric,
    String,
    Unknown,
}

impl DataType {
    #[must_use]
    pub const fn byte_width(self) -> Option<usize> {
        match self {
            Self::Int32 | Self::Float => Some(4),
            Self::Int64 | Self::Double => Some(8),
            Self::String | Self::Invalid => None,
        }
    }

    #[must_use]
    pub const fn kind(self) -> TypeKind {
        match self {
            Self::Int32 | Self::Int64 | Self::Float | Self::Double => TypeKind::Numeric,
            Self::String => TypeKind::String,
            Self::Invalid => TypeKind::Unknown,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Invalid => "Invalid",
            Self::Int32 => "Int32",
            Self::Int64 => "Int64",
            Self::Float => "Float",
            Self::Double => "Double",
            Self::String => "String",
        };
        f.write_str(label)
    }
}

/// Expands a generic body over every supported dtype, including strings.
/// The body sees the concrete element type bound to `$T`. Dispatching an
/// `Invalid` dtype is a caller bug and aborts with a diagnostic.
#[macro_export]
macro_rules! all_dtype_cases {
    ($dtype:expr, $T:ident, $body:expr) => {
        match $dtype {
            $crate::DataType::Int32 => {
                type $T = i32;
                $body
            }
            $crate::DataType::Int64 => {
                type $T = i64;
                $body
            }
            $crate::DataType::Float => {
                type $T = f32;
                $body
            }
            $crate::DataType::Double => {
                type $T = f64;
                $body
            }
            $crate::DataType::String => {
                type $T = ::std::string::String;
                $body
            }
            other => panic!("all_dtype_cases: unsupported type {other}"),
        }
    };
}

/// Same as [`all_dtype_cases!`] but restricted to numeric dtypes.
/// Dispatching a string or invalid dtype here is a caller bug.
#[macro_export]
macro_rules! numeric_dtype_cases {
    ($dtype:expr, $T:ident, $body:expr) => {
        match $dtype {
            $crate::DataType::Int32 => {
                type $T = i32;
                $body
            }
            $crate::DataType::Int64 => {
                type $T = i64;
                $body
            }
            $crate::DataType::Float => {
                type $T = f32;
                $body
            }
            $crate::DataType::Double => {
                type $T = f64;
                $body
            }
            other => panic!("numeric_dtype_cases: unsupported type {other}"),
        }
    };
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TensorShape {
    dim_sizes: Vec<i64>,
}

impl TensorShape {
    #[must_use]
    pub fn new(dim_sizes: Vec<i64>) -> Self {
        Self { dim_sizes }
    }

    #[must_use]
    pub fn scalar() -> Self {
        Self {
            dim_sizes: Vec::new(),
        }
    }

    #[must_use]
    pub fn vector(len: i64) -> Self {
        Self {
            dim_sizes: vec![len],
        }
    }

    /// The canonical spec-time shape of a grouping column: one dimension
    /// of unknown size.
    #[must_use]
    pub fn unknown_vector() -> Self {
        Self {
            dim_sizes: vec![UNKNOWN_DIM],
        }
    }

    #[must_use]
    pub fn dim_sizes(&self) -> &[i64] {
        &self.dim_sizes
    }

    #[must_use]
    pub fn is_fully_defined(&self) -> bool {
        self.dim_sizes.iter().all(|&d| d >= 0)
    }

    /// Defined only when every dimension size is non-negative.
    #[must_use]
    pub fn num_elements(&self) -> Option<usize> {
        if !self.is_fully_defined() {
            return None;
        }
        let mut total = 1usize;
        for &dim in &self.dim_sizes {
            total = total.checked_mul(dim as usize)?;
        }
        Some(total)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    I32(Vec<i32>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    Str(Vec<String>),
}

impl TensorData {
    #[must_use]
    pub fn dtype(&self) -> DataType {
        match self {
            Self::I32(_) => DataType::Int32,
            Self::I64(_) => DataType::Int64,
            Self::F32(_) => DataType::Float,
            Self::F64(_) => DataType::Double,
            Self::Str(_) => DataType::String,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::I32(v) => v.len(),
            Self::I64(v) => v.len(),
            Self::F32(v) => v.len(),
            Self::F64(v) => v.len(),
            Self::Str(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// An empty buffer of the given dtype, used when growing columns.
    #[must_use]
    pub fn empty(dtype: DataType) -> Self {
        all_dtype_cases!(dtype, T, <T as TensorValue>::vec_into_data(Vec::new()))
    }
}

/// Element types a tensor can hold. Implementations tie a Rust type to its
/// [`DataType`] tag and the matching [`TensorData`] variant.
pub trait TensorValue: Clone + PartialEq + fmt::Debug + 'static {
    const DATA_TYPE: DataType;

    fn slice_of(data: &TensorData) -> Option<&[Self]>;
    fn vec_into_data(values: Vec<Self>) -> TensorData;
    fn data_into_vec(data: TensorData) -> Option<Vec<Self>>;
}

/// Numeric element types, with the casts used by scalar access and the
/// DP bounding path. `from_f64` truncates toward zero for integers.
pub trait NumericValue:
    TensorValue + Copy + PartialOrd + std::ops::AddAssign + std::ops::Neg<Output = Self>
{
    const ZERO: Self;

    fn to_f64(self) -> f64;
    fn from_f64(value: f64) -> Self;
}

/// Exact input-to-output widening for the supported grouping sum pairs.
/// Kept as an explicit per-pair table so accumulators never route exact
/// integer paths through floating point.
pub trait WideningCast<O> {
    fn widen(self) -> O;
}

impl WideningCast<i64> for i32 {
    fn widen(self) -> i64 {
        i64::from(self)
    }
}

impl WideningCast<i64> for i64 {
    fn widen(self) -> i64 {
        self
    }
}

impl WideningCast<f64> for f32 {
    fn widen(self) -> f64 {
        f64::from(self)
    }
}

impl WideningCast<f64> for f64 {
    fn widen(self) -> f64 {
        self
    }
}

macro_rules! impl_tensor_value {
    ($rust:ty, $dtype:expr, $variant:ident) => {
        impl TensorValue for $rust {
            const DATA_TYPE: DataType = $dtype;

            fn slice_of(data: &TensorData) -> Option<&[Self]> {
                match data {
                    TensorData::$variant(v) => Some(v.as_slice()),
                    _ => None,
                }
            }

            fn vec_into_data(values: Vec<Self>) -> TensorData {
                TensorData::$variant(values)
            }

            fn data_into_vec(data: TensorData) -> Option<Vec<Self>> {
                match data {
                    TensorData::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

impl_tensor_value!(i32, DataType::Int32, I32);
impl_tensor_value!(i64, DataType::Int64, I64);
impl_tensor_value!(f32, DataType::Float, F32);
impl_tensor_value!(f64, DataType::Double, F64);
impl_tensor_value!(String, DataType::String, Str);

impl NumericValue for i32 {
    const ZERO: Self = 0;

    fn to_f64(self) -> f64 {
        f64::from(self)
    }

    fn from_f64(value: f64) -> Self {
        value as i32
    }
}

impl NumericValue for i64 {
    const ZERO: Self = 0;

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn from_f64(value: f64) -> Self {
        value as i64
    }
}

impl NumericValue for f32 {
    const ZERO: Self = 0.0;

    fn to_f64(self) -> f64 {
        f64::from(self)
    }

    fn from_f64(value: f64) -> Self {
        value as f32
    }
}

impl NumericValue for f64 {
    const ZERO: Self = 0.0;

    fn to_f64(self) -> f64 {
        self
    }

    fn from_f64(value: f64) -> Self {
        value
    }
}

/// A typed, shaped, dense value buffer. Tensors are move-only: the buffer
/// is exclusively owned by a single aggregator at a time and ownership
/// transfers explicitly through `into_data`/`take_outputs`.
#[derive(Debug, PartialEq)]
pub struct Tensor {
    dtype: DataType,
    shape: TensorShape,
    data: TensorData,
}

impl Tensor {
    pub fn create(
        dtype: DataType,
        shape: TensorShape,
        data: TensorData,
    ) -> Result<Self, AggregationError> {
        if dtype == DataType::Invalid {
            return Err(AggregationError::invalid_argument(
                "Tensor::create: Invalid dtype",
            ));
        }
        let Some(num_elements) = shape.num_elements() else {
            return Err(AggregationError::invalid_argument(format!(
                "Tensor::create: shape {:?} has unresolved or negative dimensions",
                shape.dim_sizes()
            )));
        };
        if data.dtype() != dtype {
            return Err(AggregationError::invalid_argument(format!(
                "Tensor::create: dtype {dtype} does not match data buffer dtype {}",
                data.dtype()
            )));
        }
        if data.len() != num_elements {
            return Err(AggregationError::invalid_argument(format!(
                "Tensor::create: buffer holds {} elements but shape implies {num_elements}",
                data.len()
            )));
        }
        Ok(Self { dtype, shape, data })
    }

    #[must_use]
    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    #[must_use]
    pub fn shape(&self) -> &TensorShape {
        &self.shape
    }

    #[must_use]
    pub fn num_elements(&self) -> usize {
        self.data.len()
    }

    // Sparse tensors are not supported; every tensor is dense row-major.
    #[must_use]
    pub fn is_dense(&self) -> bool {
        true
    }

    #[must_use]
    pub fn data(&self) -> &TensorData {
        &self.data
    }

    #[must_use]
    pub fn into_data(self) -> TensorData {
        self.data
    }

    /// Flat typed view of the buffer. A dtype mismatch is a programming
    /// error in the caller, not a recoverable condition.
    #[must_use]
    pub fn as_slice<T: TensorValue>(&self) -> &[T] {
        match T::slice_of(&self.data) {
            Some(slice) => slice,
            None => panic!(
                "Tensor::as_slice: incompatible dtype, tensor holds {} but {} was requested",
                self.dtype,
                T::DATA_TYPE
            ),
        }
    }

    /// Scalar access with numeric casting across numeric dtypes. Exact
    /// when the requested type matches the stored dtype.
    #[must_use]
    pub fn as_scalar<T: NumericValue>(&self) -> T {
        assert!(
            self.num_elements() == 1,
            "Tensor::as_scalar: requires exactly one element, tensor has {}",
            self.num_elements()
        );
        if self.dtype == T::DATA_TYPE {
            return self.as_slice::<T>()[0];
        }
        numeric_dtype_cases!(self.dtype, K, {
            T::from_f64(self.as_slice::<K>()[0].to_f64())
        })
    }

    #[must_use]
    pub fn as_scalar_str(&self) -> &str {
        assert!(
            self.num_elements() == 1,
            "Tensor::as_scalar_str: requires exactly one element, tensor has {}",
            self.num_elements()
        );
        &self.as_slice::<String>()[0]
    }
}

/// Declarative (name, dtype, shape) contract for an input or output
/// column. An empty name marks an anonymous internal column that must not
/// be emitted in report outputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorSpec {
    name: String,
    dtype: DataType,
    shape: TensorShape,
}

impl TensorSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, dtype: DataType, shape: TensorShape) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    #[must_use]
    pub fn shape(&self) -> &TensorShape {
        &self.shape
    }

    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.name.is_empty()
    }
}

/// Declarative aggregation operator descriptor. Parameters are constant
/// tensors (e.g. DP bounds); nested intrinsics let composite aggregators
/// describe their children recursively.
#[derive(Debug, PartialEq)]
pub struct Intrinsic {
    pub uri: String,
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
    pub parameters: Vec<Tensor>,
    pub nested_intrinsics: Vec<Intrinsic>,
}

impl Intrinsic {
    #[must_use]
    pub fn new(
        uri: impl Into<String>,
        inputs: Vec<TensorSpec>,
        outputs: Vec<TensorSpec>,
        parameters: Vec<Tensor>,
        nested_intrinsics: Vec<Intrinsic>,
    ) -> Self {
        Self {
            uri: uri.into(),
            inputs,
            outputs,
            parameters,
            nested_intrinsics,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use super::{
        AggregationError, DataType, ErrorCode, Tensor, TensorData, TensorShape, TensorSpec,
        TensorValue, TypeKind,
    };

    fn det_seed(parts: &[u64]) -> u64 {
        let mut hash = 0xcbf2_9ce4_8422_2325u64;
        for value in parts {
            for byte in value.to_le_bytes() {
                hash ^= u64::from(byte);
                hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
            }
        }
        hash
    }

    fn build_property_log(
        test_id: &str,
        seed: u64,
        input_digest: u64,
        output_digest: u64,
        reason_code: &str,
    ) -> BTreeMap<String, String> {
        let mut log = BTreeMap::new();
        log.insert("ts_utc".to_string(), "1970-01-01T00:00:00Z".to_string());
        log.insert("suite_id".to_string(), "ff_core_property".to_string());
        log.insert("test_id".to_string(), test_id.to_string());
        log.insert("packet_id".to_string(), "FF-AGG-001".to_string());
        log.insert(
            "fixture_id".to_string(),
            "ff_core_property_generated".to_string(),
        );
        log.insert(
            "scenario_id".to_string(),
            format!("ff_core_property:{test_id}"),
        );
        log.insert("seed".to_string(), seed.to_string());
        log.insert(
            "input_digest".to_string(),
            format!("det64:{input_digest:016x}"),
        );
        log.insert(
            "output_digest".to_string(),
            format!("det64:{output_digest:016x}"),
        );
        log.insert(
            "env_fingerprint".to_string(),
            "det64:ff-core-test".to_string(),
        );
        log.insert(
            "replay_command".to_string(),
            format!("cargo test -p ff-core {test_id} -- --nocapture"),
        );
        log.insert("outcome".to_string(), "pass".to_string());
        log.insert("reason_code".to_string(), reason_code.to_string());
        log
    }

    fn assert_log_contract(log: &BTreeMap<String, String>) {
        for key in [
            "ts_utc",
            "suite_id",
            "test_id",
            "packet_id",
            "fixture_id",
            "scenario_id",
            "seed",
            "input_digest",
            "output_digest",
            "env_fingerprint",
            "replay_command",
            "outcome",
            "reason_code",
        ] {
            assert!(
                log.contains_key(key),
                "property log missing required key '{key}'"
            );
        }
    }

    #[test]
    fn dtype_byte_widths_and_kinds() {
        assert_eq!(DataType::Int32.byte_width(), Some(4));
        assert_eq!(DataType::Int64.byte_width(), Some(8));
        assert_eq!(DataType::Float.byte_width(), Some(4));
        assert_eq!(DataType::Double.byte_width(), Some(8));
        assert_eq!(DataType::String.byte_width(), None);
        assert_eq!(DataType::Invalid.byte_width(), None);

        assert_eq!(DataType::Int64.kind(), TypeKind::Numeric);
        assert_eq!(DataType::String.kind(), TypeKind::String);
        assert_eq!(DataType::Invalid.kind(), TypeKind::Unknown);
    }

    #[test]
    fn shape_num_elements_defined_only_when_fully_resolved() {
        assert_eq!(TensorShape::scalar().num_elements(), Some(1));
        assert_eq!(TensorShape::vector(4).num_elements(), Some(4));
        assert_eq!(TensorShape::new(vec![2, 3]).num_elements(), Some(6));
        assert_eq!(TensorShape::unknown_vector().num_elements(), None);
        assert!(!TensorShape::unknown_vector().is_fully_defined());
    }

    #[test]
    fn shape_equality_is_dimension_sequence_equality() {
        assert_eq!(TensorShape::vector(3), TensorShape::new(vec![3]));
        assert_ne!(TensorShape::vector(3), TensorShape::new(vec![3, 1]));
        assert_ne!(TensorShape::scalar(), TensorShape::vector(1));
    }

    #[test]
    fn tensor_create_validates_inputs() {
        let ok = Tensor::create(
            DataType::Int32,
            TensorShape::vector(3),
            TensorData::I32(vec![1, 2, 3]),
        );
        assert!(ok.is_ok());

        let err = Tensor::create(
            DataType::Invalid,
            TensorShape::scalar(),
            TensorData::I32(vec![0]),
        )
        .expect_err("invalid dtype must fail");
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        let err = Tensor::create(
            DataType::Int32,
            TensorShape::unknown_vector(),
            TensorData::I32(vec![1]),
        )
        .expect_err("unresolved dimension must fail");
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        let err = Tensor::create(
            DataType::Int32,
            TensorShape::vector(2),
            TensorData::I32(vec![1, 2, 3]),
        )
        .expect_err("length mismatch must fail");
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        let err = Tensor::create(
            DataType::Int64,
            TensorShape::vector(2),
            TensorData::I32(vec![1, 2]),
        )
        .expect_err("buffer dtype mismatch must fail");
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[test]
    fn typed_view_reads_dense_buffer() {
        let tensor = Tensor::create(
            DataType::Int64,
            TensorShape::vector(4),
            TensorData::I64(vec![5, 6, 7, 8]),
        )
        .expect("tensor should validate");
        assert_eq!(tensor.as_slice::<i64>(), &[5, 6, 7, 8]);
        assert!(tensor.is_dense());

        // Ownership of the backing buffer transfers out explicitly.
        let data = tensor.into_data();
        assert_eq!(
            <i64 as TensorValue>::data_into_vec(data),
            Some(vec![5, 6, 7, 8])
        );
    }

    #[test]
    #[should_panic(expected = "incompatible dtype")]
    fn typed_view_mismatch_is_a_caller_bug() {
        let tensor = Tensor::create(
            DataType::Int64,
            TensorShape::vector(1),
            TensorData::I64(vec![1]),
        )
        .expect("tensor should validate");
        let _ = tensor.as_slice::<i32>();
    }

    #[test]
    fn scalar_access_casts_across_numeric_dtypes() {
        let int_scalar = Tensor::create(
            DataType::Int32,
            TensorShape::scalar(),
            TensorData::I32(vec![-7]),
        )
        .expect("tensor should validate");
        assert_eq!(int_scalar.as_scalar::<i32>(), -7);
        assert_eq!(int_scalar.as_scalar::<i64>(), -7);
        assert_eq!(int_scalar.as_scalar::<f64>(), -7.0);

        let wide = Tensor::create(
            DataType::Int64,
            TensorShape::scalar(),
            TensorData::I64(vec![i64::MAX]),
        )
        .expect("tensor should validate");
        // The matching-dtype path must be exact even past 2^53.
        assert_eq!(wide.as_scalar::<i64>(), i64::MAX);
    }

    #[test]
    fn scalar_string_access_borrows() {
        let tensor = Tensor::create(
            DataType::String,
            TensorShape::scalar(),
            TensorData::Str(vec!["key".to_string()]),
        )
        .expect("tensor should validate");
        assert_eq!(tensor.as_scalar_str(), "key");
    }

    #[test]
    #[should_panic(expected = "exactly one element")]
    fn scalar_access_requires_single_element() {
        let tensor = Tensor::create(
            DataType::Int32,
            TensorShape::vector(2),
            TensorData::I32(vec![1, 2]),
        )
        .expect("tensor should validate");
        let _ = tensor.as_scalar::<i32>();
    }

    #[test]
    fn anonymous_specs_are_flagged() {
        let named = TensorSpec::new("key", DataType::String, TensorShape::unknown_vector());
        let anon = TensorSpec::new("", DataType::String, TensorShape::unknown_vector());
        assert!(!named.is_anonymous());
        assert!(anon.is_anonymous());
    }

    #[test]
    fn error_display_names_code_and_message() {
        let err = AggregationError::invalid_argument("Unsupported input type");
        assert_eq!(err.to_string(), "invalid argument: Unsupported input type");
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        let err = AggregationError::failed_precondition("output already consumed");
        assert!(err.to_string().starts_with("failed precondition"));
    }

    #[test]
    fn dispatch_macro_expands_numeric_body() {
        let dtype = DataType::Double;
        let width = numeric_dtype_cases!(dtype, T, std::mem::size_of::<T>());
        assert_eq!(width, 8);

        let dtype = DataType::String;
        let is_string = all_dtype_cases!(dtype, T, {
            std::any::TypeId::of::<T>() == std::any::TypeId::of::<String>()
        });
        assert!(is_string);
    }

    #[test]
    #[should_panic(expected = "unsupported type")]
    fn numeric_dispatch_rejects_string_dtype() {
        let dtype = DataType::String;
        let _ = numeric_dtype_cases!(dtype, T, std::mem::size_of::<T>());
    }

    proptest! {
        #[test]
        fn prop_num_elements_matches_dimension_product(
            dims in prop::collection::vec(0i64..=6, 0..=3),
        ) {
            let shape = TensorShape::new(dims.clone());
            let expected: usize = dims.iter().map(|&d| d as usize).product();
            prop_assert_eq!(shape.num_elements(), Some(expected));

            let seed = det_seed(&[dims.len() as u64, expected as u64]);
            let log = build_property_log(
                "prop_num_elements_matches_dimension_product",
                seed,
                seed,
                expected as u64,
                "num_elements_product_contract_ok",
            );
            assert_log_contract(&log);
        }

        #[test]
        fn prop_unknown_dim_leaves_num_elements_undefined(
            prefix in prop::collection::vec(0i64..=4, 0..=2),
            suffix in prop::collection::vec(0i64..=4, 0..=2),
        ) {
            let mut dims = prefix.clone();
            dims.push(super::UNKNOWN_DIM);
            dims.extend_from_slice(&suffix);
            let shape = TensorShape::new(dims);
            prop_assert_eq!(shape.num_elements(), None);

            let seed = det_seed(&[prefix.len() as u64, suffix.len() as u64]);
            let log = build_property_log(
                "prop_unknown_dim_leaves_num_elements_undefined",
                seed,
                seed,
                0,
                "unknown_dim_undefined_contract_ok",
            );
            assert_log_contract(&log);
        }

        #[test]
        fn prop_tensor_create_round_trips_buffer(
            values in prop::collection::vec(-1_000i64..1_000, 0..32),
        ) {
            let len = values.len() as i64;
            let tensor = Tensor::create(
                DataType::Int64,
                TensorShape::vector(len),
                TensorData::I64(values.clone()),
            )
            .expect("valid tensor should create");
            prop_assert_eq!(tensor.num_elements(), values.len());
            prop_assert_eq!(tensor.as_slice::<i64>(), values.as_slice());

            let digest = det_seed(&values.iter().map(|&v| v as u64).collect::<Vec<_>>());
            let log = build_property_log(
                "prop_tensor_create_round_trips_buffer",
                digest,
                digest,
                tensor.num_elements() as u64,
                "tensor_create_roundtrip_ok",
            );
            assert_log_contract(&log);
        }
    }
}
