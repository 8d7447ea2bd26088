#![forbid(unsafe_code)]

use std::collections::HashMap;

use ff_core::{AggregationError, DataType, Tensor, TensorData, TensorShape};

/// First four bytes of every federated checkpoint. Readers compare the
/// exact bytes.
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"FCC\x00";

const DTYPE_FIELD: u64 = 1;
const DIM_SIZES_FIELD: u64 = 2;
const INT32_PAYLOAD_FIELD: u64 = 3;
const INT64_PAYLOAD_FIELD: u64 = 4;
const FLOAT_PAYLOAD_FIELD: u64 = 5;
const DOUBLE_PAYLOAD_FIELD: u64 = 6;
const STRING_PAYLOAD_FIELD: u64 = 7;

const WIRE_VARINT: u64 = 0;
const WIRE_LENGTH_DELIMITED: u64 = 2;

fn dtype_code(dtype: DataType) -> u64 {
    match dtype {
        DataType::Invalid => 0,
        DataType::Int32 => 1,
        DataType::Int64 => 2,
        DataType::Float => 3,
        DataType::Double => 4,
        DataType::String => 5,
    }
}

fn code_dtype(code: u64) -> Option<DataType> {
    match code {
        1 => Some(DataType::Int32),
        2 => Some(DataType::Int64),
        3 => Some(DataType::Float),
        4 => Some(DataType::Double),
        5 => Some(DataType::String),
        _ => None,
    }
}

fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

fn write_tag(buf: &mut Vec<u8>, field: u64, wire_type: u64) {
    write_varint(buf, (field << 3) | wire_type);
}

fn write_length_delimited(buf: &mut Vec<u8>, field: u64, payload: &[u8]) {
    write_tag(buf, field, WIRE_LENGTH_DELIMITED);
    write_varint(buf, payload.len() as u64);
    buf.extend_from_slice(payload);
}

struct ByteReader<'a> {
    bytes: &'a [u8],
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.bytes.len() < len {
            return None;
        }
        let (head, tail) = self.bytes.split_at(len);
        self.bytes = tail;
        Some(head)
    }

    fn read_varint(&mut self) -> Option<u64> {
        let mut value = 0u64;
        for shift_index in 0..10 {
            let (&byte, tail) = self.bytes.split_first()?;
            self.bytes = tail;
            let payload = u64::from(byte & 0x7f);
            // The tenth byte only carries the final bit of a u64.
            if shift_index == 9 && byte > 0x01 {
                return None;
            }
            value |= payload << (shift_index * 7);
            if byte & 0x80 == 0 {
                return Some(value);
            }
        }
        None
    }
}

/// Serializes a tensor as the checkpoint sub-message: dtype, dim sizes,
/// and one packed payload field chosen by dtype.
fn encode_tensor_proto(tensor: &Tensor) -> Vec<u8> {
    let mut buf = Vec::new();
    write_tag(&mut buf, DTYPE_FIELD, WIRE_VARINT);
    write_varint(&mut buf, dtype_code(tensor.dtype()));

    let mut dims = Vec::new();
    for &dim in tensor.shape().dim_sizes() {
        write_varint(&mut dims, dim as u64);
    }
    write_length_delimited(&mut buf, DIM_SIZES_FIELD, &dims);

    let mut payload = Vec::new();
    match tensor.data() {
        TensorData::I32(values) => {
            for &value in values {
                write_varint(&mut payload, i64::from(value) as u64);
            }
            write_length_delimited(&mut buf, INT32_PAYLOAD_FIELD, &payload);
        }
        TensorData::I64(values) => {
            for &value in values {
                write_varint(&mut payload, value as u64);
            }
            write_length_delimited(&mut buf, INT64_PAYLOAD_FIELD, &payload);
        }
        TensorData::F32(values) => {
            for &value in values {
                payload.extend_from_slice(&value.to_le_bytes());
            }
            write_length_delimited(&mut buf, FLOAT_PAYLOAD_FIELD, &payload);
        }
        TensorData::F64(values) => {
            for &value in values {
                payload.extend_from_slice(&value.to_le_bytes());
            }
            write_length_delimited(&mut buf, DOUBLE_PAYLOAD_FIELD, &payload);
        }
        TensorData::Str(values) => {
            for value in values {
                write_length_delimited(&mut buf, STRING_PAYLOAD_FIELD, value.as_bytes());
            }
        }
    }
    buf
}

fn malformed(detail: impl Into<String>) -> AggregationError {
    AggregationError::invalid_argument(format!(
        "malformed tensor sub-message: {}",
        detail.into()
    ))
}

fn decode_tensor_proto(bytes: &[u8]) -> Result<Tensor, AggregationError> {
    let mut reader = ByteReader::new(bytes);
    let mut dtype = None;
    let mut dim_sizes: Vec<i64> = Vec::new();
    let mut data: Option<TensorData> = None;
    let mut string_values: Vec<String> = Vec::new();

    while !reader.is_empty() {
        let tag = reader
            .read_varint()
            .ok_or_else(|| malformed("truncated field tag"))?;
        let field = tag >> 3;
        let wire_type = tag & 0x7;
        match (field, wire_type) {
            (DTYPE_FIELD, WIRE_VARINT) => {
                let code = reader
                    .read_varint()
                    .ok_or_else(|| malformed("truncated dtype"))?;
                dtype = Some(
                    code_dtype(code).ok_or_else(|| malformed(format!("unknown dtype code {code}")))?,
                );
            }
            (DIM_SIZES_FIELD, WIRE_LENGTH_DELIMITED) => {
                let len = reader
                    .read_varint()
                    .ok_or_else(|| malformed("truncated dim sizes length"))?;
                let packed = reader
                    .read_bytes(len as usize)
                    .ok_or_else(|| malformed("truncated dim sizes"))?;
                let mut dims = ByteReader::new(packed);
                while !dims.is_empty() {
                    let dim = dims
                        .read_varint()
                        .ok_or_else(|| malformed("truncated dim size varint"))?
                        as i64;
                    if dim < 0 {
                        return Err(malformed(format!("negative dimension size {dim}")));
                    }
                    dim_sizes.push(dim);
                }
            }
            (INT32_PAYLOAD_FIELD, WIRE_LENGTH_DELIMITED) => {
                let values = read_packed_varints(&mut reader, "int32 payload")?;
                let mut narrowed = Vec::with_capacity(values.len());
                for value in values {
                    narrowed.push(i32::try_from(value).map_err(|_| {
                        malformed(format!("int32 payload value {value} out of range"))
                    })?);
                }
                set_payload(&mut data, TensorData::I32(narrowed))?;
            }
            (INT64_PAYLOAD_FIELD, WIRE_LENGTH_DELIMITED) => {
                let values = read_packed_varints(&mut reader, "int64 payload")?;
                set_payload(&mut data, TensorData::I64(values))?;
            }
            (FLOAT_PAYLOAD_FIELD, WIRE_LENGTH_DELIMITED) => {
                let packed = read_delimited(&mut reader, "float payload")?;
                if packed.len() % 4 != 0 {
                    return Err(malformed("float payload length is not a multiple of 4"));
                }
                let values = packed
                    .chunks_exact(4)
                    .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                    .collect();
                set_payload(&mut data, TensorData::F32(values))?;
            }
            (DOUBLE_PAYLOAD_FIELD, WIRE_LENGTH_DELIMITED) => {
                let packed = read_delimited(&mut reader, "double payload")?;
                if packed.len() % 8 != 0 {
                    return Err(malformed("double payload length is not a multiple of 8"));
                }
                let values = packed
                    .chunks_exact(8)
                    .map(|chunk| {
                        let mut bytes = [0u8; 8];
                        bytes.copy_from_slice(chunk);
                        f64::from_le_bytes(bytes)
                    })
                    .collect();
                set_payload(&mut data, TensorData::F64(values))?;
            }
            (STRING_PAYLOAD_FIELD, WIRE_LENGTH_DELIMITED) => {
                let bytes = read_delimited(&mut reader, "string payload")?;
                let value = std::str::from_utf8(bytes)
                    .map_err(|_| malformed("string payload is not valid UTF-8"))?;
                string_values.push(value.to_string());
            }
            (field, wire_type) => {
                return Err(malformed(format!(
                    "unexpected field {field} with wire type {wire_type}"
                )));
            }
        }
    }

    if !string_values.is_empty() {
        set_payload(&mut data, TensorData::Str(string_values))?;
    }
    let dtype = dtype.ok_or_else(|| malformed("missing dtype"))?;
    let data = data.unwrap_or_else(|| TensorData::empty(dtype));
    if data.dtype() != dtype {
        return Err(malformed(format!(
            "payload dtype {} does not match declared dtype {dtype}",
            data.dtype()
        )));
    }
    Tensor::create(dtype, TensorShape::new(dim_sizes), data)
        .map_err(|error| malformed(error.message().to_string()))
}

fn read_delimited<'a>(
    reader: &mut ByteReader<'a>,
    what: &str,
) -> Result<&'a [u8], AggregationError> {
    let len = reader
        .read_varint()
        .ok_or_else(|| malformed(format!("truncated {what} length")))?;
    reader
        .read_bytes(len as usize)
        .ok_or_else(|| malformed(format!("truncated {what}")))
}

fn read_packed_varints(
    reader: &mut ByteReader<'_>,
    what: &str,
) -> Result<Vec<i64>, AggregationError> {
    let packed = read_delimited(reader, what)?;
    let mut values = Vec::new();
    let mut packed_reader = ByteReader::new(packed);
    while !packed_reader.is_empty() {
        let value = packed_reader
            .read_varint()
            .ok_or_else(|| malformed(format!("truncated varint in {what}")))?;
        values.push(value as i64);
    }
    Ok(values)
}

fn set_payload(
    data: &mut Option<TensorData>,
    payload: TensorData,
) -> Result<(), AggregationError> {
    if data.is_some() {
        return Err(malformed("more than one payload field"));
    }
    *data = Some(payload);
    Ok(())
}

/// Writes a named-tensor checkpoint in the caller-provided order.
pub struct CheckpointBuilder {
    buffer: Vec<u8>,
}

impl Default for CheckpointBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckpointBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: CHECKPOINT_MAGIC.to_vec(),
        }
    }

    /// Appends one named tensor. An empty name is reserved for the end
    /// marker and rejected.
    pub fn add(&mut self, name: &str, tensor: &Tensor) -> Result<(), AggregationError> {
        if name.is_empty() {
            return Err(AggregationError::invalid_argument(
                "CheckpointBuilder: tensor names must be nonempty",
            ));
        }
        write_varint(&mut self.buffer, name.len() as u64);
        self.buffer.extend_from_slice(name.as_bytes());
        let tensor_bytes = encode_tensor_proto(tensor);
        write_varint(&mut self.buffer, tensor_bytes.len() as u64);
        self.buffer.extend_from_slice(&tensor_bytes);
        Ok(())
    }

    #[must_use]
    pub fn build(mut self) -> Vec<u8> {
        write_varint(&mut self.buffer, 0);
        self.buffer
    }
}

/// Reads a named-tensor checkpoint into a by-name map. Framing damage
/// (bad magic, truncation) is `Internal`; a malformed tensor sub-message
/// is `InvalidArgument`.
#[derive(Debug)]
pub struct CheckpointParser {
    tensors: HashMap<String, Tensor>,
}

impl CheckpointParser {
    pub fn parse(bytes: &[u8]) -> Result<Self, AggregationError> {
        let mut reader = ByteReader::new(bytes);
        let header = reader.read_bytes(CHECKPOINT_MAGIC.len()).ok_or_else(|| {
            AggregationError::internal("unable to read checkpoint header")
        })?;
        if header != CHECKPOINT_MAGIC.as_slice() {
            return Err(AggregationError::internal(format!(
                "unsupported checkpoint format: header {header:02x?}"
            )));
        }

        let mut tensors = HashMap::new();
        loop {
            let name_len = reader.read_varint().ok_or_else(|| {
                AggregationError::internal("unable to read next tensor name size")
            })?;
            if name_len == 0 {
                break;
            }
            let name_bytes = reader.read_bytes(name_len as usize).ok_or_else(|| {
                AggregationError::internal("unable to read next tensor name")
            })?;
            let name = std::str::from_utf8(name_bytes)
                .map_err(|_| {
                    AggregationError::invalid_argument("tensor name is not valid UTF-8")
                })?
                .to_string();
            let tensor_len = reader.read_varint().ok_or_else(|| {
                AggregationError::internal(format!("unable to read tensor size for '{name}'"))
            })?;
            let tensor_bytes = reader.read_bytes(tensor_len as usize).ok_or_else(|| {
                AggregationError::internal(format!("unable to read tensor bytes for '{name}'"))
            })?;
            let tensor = decode_tensor_proto(tensor_bytes).map_err(|error| {
                AggregationError::new(
                    error.code(),
                    format!("tensor '{name}': {}", error.message()),
                )
            })?;
            if tensors.insert(name.clone(), tensor).is_some() {
                return Err(AggregationError::invalid_argument(format!(
                    "duplicate tensor name '{name}' in checkpoint"
                )));
            }
        }
        Ok(Self { tensors })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Moves the named tensor out of the parser.
    pub fn take_tensor(&mut self, name: &str) -> Result<Tensor, AggregationError> {
        self.tensors.remove(name).ok_or_else(|| {
            AggregationError::not_found(format!("no aggregation tensor found for name '{name}'"))
        })
    }

    #[must_use]
    pub fn into_tensors(self) -> HashMap<String, Tensor> {
        self.tensors
    }
}
