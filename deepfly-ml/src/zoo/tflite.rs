//! TensorFlow Lite flatbuffer export.
//!
//! Writes a single-subgraph `model.tflite` against TFLite schema version 3,
//! built with the raw `flatbuffers` builder. Every Meso-4 block applies its
//! ReLU before batch normalization, so normalization cannot be folded into
//! the convolution and is emitted as a per-channel `MUL` then `ADD`.
//! Dropout is an identity at inference and is left out.

use crate::error::MlError;
use crate::nn::{Activation, INPUT_CHANNELS, INPUT_SIZE, Layer, Network};
use flatbuffers::{FlatBufferBuilder, TableFinishedWIPOffset, WIPOffset};
use std::path::Path;
use tracing::debug;

pub const TFLITE_FILE: &str = "model.tflite";

const FILE_IDENTIFIER: &str = "TFL3";
const SCHEMA_VERSION: u32 = 3;

// vtable slots: 4 + 2 * field index.
const MODEL_VERSION: u16 = 4;
const MODEL_OPERATOR_CODES: u16 = 6;
const MODEL_SUBGRAPHS: u16 = 8;
const MODEL_DESCRIPTION: u16 = 10;
const MODEL_BUFFERS: u16 = 12;

const OPCODE_DEPRECATED_BUILTIN: u16 = 4;
const OPCODE_VERSION: u16 = 8;
const OPCODE_BUILTIN: u16 = 10;

const SUBGRAPH_TENSORS: u16 = 4;
const SUBGRAPH_INPUTS: u16 = 6;
const SUBGRAPH_OUTPUTS: u16 = 8;
const SUBGRAPH_OPERATORS: u16 = 10;
const SUBGRAPH_NAME: u16 = 12;

const TENSOR_SHAPE: u16 = 4;
const TENSOR_TYPE: u16 = 6;
const TENSOR_BUFFER: u16 = 8;
const TENSOR_NAME: u16 = 10;

const BUFFER_DATA: u16 = 4;

const OPERATOR_OPCODE_INDEX: u16 = 4;
const OPERATOR_INPUTS: u16 = 6;
const OPERATOR_OUTPUTS: u16 = 8;
const OPERATOR_OPTIONS_TYPE: u16 = 10;
const OPERATOR_OPTIONS: u16 = 12;

/// The `BuiltinOperator` codes MesoNet needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuiltinOp {
    Add = 0,
    Conv2d = 3,
    FullyConnected = 9,
    Logistic = 14,
    MaxPool2d = 17,
    Mul = 18,
    Reshape = 22,
    Softmax = 25,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TensorType {
    Float32 = 0,
    Int32 = 2,
}

/// `ActivationFunctionType`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fused {
    None = 0,
    Relu = 1,
}

/// `BuiltinOptions` payloads; padding is always SAME and strides follow
/// the layer definitions.
#[derive(Debug, Clone, PartialEq)]
enum Options {
    None,
    Conv2d { fused: Fused },
    Pool2d { size: i32 },
    FullyConnected { fused: Fused },
    Softmax,
    Add,
    Mul,
    Reshape { new_shape: Vec<i32> },
}

impl Options {
    /// Union tag in `BuiltinOptions`.
    fn union_type(&self) -> u8 {
        match self {
            Options::None => 0,
            Options::Conv2d { .. } => 1,
            Options::Pool2d { .. } => 5,
            Options::FullyConnected { .. } => 8,
            Options::Softmax => 9,
            Options::Add => 11,
            Options::Reshape { .. } => 17,
            Options::Mul => 21,
        }
    }
}

#[derive(Debug)]
struct TensorSpec {
    name: String,
    shape: Vec<i32>,
    dtype: TensorType,
    buffer: u32,
}

#[derive(Debug)]
struct OperatorSpec {
    op: BuiltinOp,
    inputs: Vec<i32>,
    outputs: Vec<i32>,
    options: Options,
}

/// The graph in TFLite terms, before serialization.
#[derive(Debug)]
struct Graph {
    tensors: Vec<TensorSpec>,
    /// Buffer 0 is the empty buffer shared by every activation tensor.
    buffers: Vec<Vec<u8>>,
    opcodes: Vec<BuiltinOp>,
    operators: Vec<OperatorSpec>,
    inputs: Vec<i32>,
    outputs: Vec<i32>,
}

fn dim(value: usize) -> Result<i32, MlError> {
    i32::try_from(value)
        .map_err(|_| MlError::conversion(format!("dimension {value} does not fit a TFLite shape")))
}

fn dims(shape: &[usize]) -> Result<Vec<i32>, MlError> {
    shape.iter().copied().map(dim).collect()
}

impl Graph {
    fn new() -> Self {
        Self {
            tensors: Vec::new(),
            buffers: vec![Vec::new()],
            opcodes: Vec::new(),
            operators: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    fn push_tensor(&mut self, tensor: TensorSpec) -> Result<i32, MlError> {
        let index = dim(self.tensors.len())?;
        self.tensors.push(tensor);
        Ok(index)
    }

    /// Runtime-computed tensor backed by the empty buffer.
    fn activation(&mut self, name: impl Into<String>, shape: &[usize]) -> Result<i32, MlError> {
        self.push_tensor(TensorSpec {
            name: name.into(),
            shape: dims(shape)?,
            dtype: TensorType::Float32,
            buffer: 0,
        })
    }

    fn constant(
        &mut self,
        name: impl Into<String>,
        shape: Vec<i32>,
        dtype: TensorType,
        data: Vec<u8>,
    ) -> Result<i32, MlError> {
        let buffer = u32::try_from(self.buffers.len())
            .map_err(|_| MlError::conversion("too many TFLite buffers"))?;
        self.buffers.push(data);
        self.push_tensor(TensorSpec {
            name: name.into(),
            shape,
            dtype,
            buffer,
        })
    }

    fn constant_f32(
        &mut self,
        name: impl Into<String>,
        shape: &[usize],
        values: impl Iterator<Item = f32>,
    ) -> Result<i32, MlError> {
        let name = name.into();
        let mut data = Vec::with_capacity(shape.iter().product::<usize>() * 4);
        for v in values {
            if !v.is_finite() {
                return Err(MlError::conversion(format!(
                    "tensor '{name}' contains a non-finite value ({v})"
                )));
            }
            data.extend_from_slice(&v.to_le_bytes());
        }
        self.constant(name, dims(shape)?, TensorType::Float32, data)
    }

    fn constant_i32(&mut self, name: impl Into<String>, values: &[i32]) -> Result<i32, MlError> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.constant(name, vec![dim(values.len())?], TensorType::Int32, data)
    }

    fn push_op(&mut self, op: BuiltinOp, inputs: Vec<i32>, outputs: Vec<i32>, options: Options) {
        if !self.opcodes.contains(&op) {
            self.opcodes.push(op);
        }
        self.operators.push(OperatorSpec {
            op,
            inputs,
            outputs,
            options,
        });
    }

    fn opcode_index(&self, op: BuiltinOp) -> u32 {
        self.opcodes
            .iter()
            .position(|o| *o == op)
            .map_or(0, |i| i as u32)
    }
}

fn fused(activation: Activation, layer: &str) -> Result<Fused, MlError> {
    match activation {
        Activation::Linear => Ok(Fused::None),
        Activation::Relu => Ok(Fused::Relu),
        other => Err(MlError::conversion(format!(
            "{layer}: {} cannot be fused into a TFLite kernel",
            other.keras_name()
        ))),
    }
}

/// Lower the sequential network into TFLite tensors and operators.
fn build_graph(network: &Network) -> Result<Graph, MlError> {
    let mut graph = Graph::new();
    let mut shape = vec![1, INPUT_SIZE, INPUT_SIZE, INPUT_CHANNELS];
    let input = graph.activation("input", &shape)?;
    let mut current = input;

    for layer in network.layers() {
        match layer {
            Layer::Conv2d(conv) => {
                let (kh, kw, cin, cout) = conv.kernel.dim();
                // Keras [kh, kw, in, out] -> TFLite OHWI.
                let filter = graph.constant_f32(
                    format!("{}/kernel", conv.name),
                    &[cout, kh, kw, cin],
                    conv.kernel.view().permuted_axes([3, 0, 1, 2]).iter().copied(),
                )?;
                let bias =
                    graph.constant_f32(format!("{}/bias", conv.name), &[cout], conv.bias.iter().copied())?;
                shape[3] = cout;
                let out = graph.activation(&conv.name, &shape)?;
                let fused = fused(conv.activation, &conv.name)?;
                graph.push_op(
                    BuiltinOp::Conv2d,
                    vec![current, filter, bias],
                    vec![out],
                    Options::Conv2d { fused },
                );
                current = out;
            }
            Layer::BatchNorm(bn) => {
                let (scale, shift) = bn.affine();
                let channels = scale.len();
                let scale =
                    graph.constant_f32(format!("{}/scale", bn.name), &[channels], scale.iter().copied())?;
                let shift =
                    graph.constant_f32(format!("{}/shift", bn.name), &[channels], shift.iter().copied())?;
                let scaled = graph.activation(format!("{}/scaled", bn.name), &shape)?;
                graph.push_op(BuiltinOp::Mul, vec![current, scale], vec![scaled], Options::Mul);
                let out = graph.activation(&bn.name, &shape)?;
                graph.push_op(BuiltinOp::Add, vec![scaled, shift], vec![out], Options::Add);
                current = out;
            }
            Layer::MaxPool2d(pool) => {
                shape[1] = shape[1].div_ceil(pool.pool_size);
                shape[2] = shape[2].div_ceil(pool.pool_size);
                let out = graph.activation(&pool.name, &shape)?;
                graph.push_op(
                    BuiltinOp::MaxPool2d,
                    vec![current],
                    vec![out],
                    Options::Pool2d {
                        size: dim(pool.pool_size)?,
                    },
                );
                current = out;
            }
            Layer::Flatten { name } => {
                let features: usize = shape[1..].iter().product();
                shape = vec![1, features];
                let new_shape = dims(&shape)?;
                let target = graph.constant_i32(format!("{name}/shape"), &new_shape)?;
                let out = graph.activation(name, &shape)?;
                graph.push_op(
                    BuiltinOp::Reshape,
                    vec![current, target],
                    vec![out],
                    Options::Reshape { new_shape },
                );
                current = out;
            }
            Layer::Dropout { .. } => {}
            Layer::Dense(dense) => {
                let (inputs, units) = dense.kernel.dim();
                // Keras [in, out] -> TFLite [out, in].
                let weights = graph.constant_f32(
                    format!("{}/kernel", dense.name),
                    &[units, inputs],
                    dense.kernel.t().iter().copied(),
                )?;
                let bias = graph.constant_f32(
                    format!("{}/bias", dense.name),
                    &[units],
                    dense.bias.iter().copied(),
                )?;
                shape = vec![1, units];

                let (fused, tail) = match dense.activation {
                    Activation::Linear => (Fused::None, None),
                    Activation::Relu => (Fused::Relu, None),
                    Activation::Sigmoid => (Fused::None, Some((BuiltinOp::Logistic, Options::None))),
                    Activation::Softmax => (Fused::None, Some((BuiltinOp::Softmax, Options::Softmax))),
                };
                let logits_name = match tail {
                    Some(_) => format!("{}/logits", dense.name),
                    None => dense.name.clone(),
                };
                let logits = graph.activation(logits_name, &shape)?;
                graph.push_op(
                    BuiltinOp::FullyConnected,
                    vec![current, weights, bias],
                    vec![logits],
                    Options::FullyConnected { fused },
                );
                current = logits;

                if let Some((op, options)) = tail {
                    let out = graph.activation(&dense.name, &shape)?;
                    graph.push_op(op, vec![current], vec![out], options);
                    current = out;
                }
            }
        }
    }

    graph.inputs = vec![input];
    graph.outputs = vec![current];
    Ok(graph)
}

fn write_options(
    fbb: &mut FlatBufferBuilder,
    options: &Options,
) -> Option<WIPOffset<TableFinishedWIPOffset>> {
    if *options == Options::None {
        return None;
    }
    // Reshape's vector has to exist before its table is started.
    let new_shape = match options {
        Options::Reshape { new_shape } => Some(fbb.create_vector(new_shape.as_slice())),
        _ => None,
    };
    let start = fbb.start_table();
    match options {
        Options::None => {}
        Options::Conv2d { fused } => {
            fbb.push_slot_always::<i8>(4, 0); // padding SAME
            fbb.push_slot_always::<i32>(6, 1); // stride_w
            fbb.push_slot_always::<i32>(8, 1); // stride_h
            fbb.push_slot_always::<i8>(10, *fused as i8);
            fbb.push_slot_always::<i32>(12, 1); // dilation_w_factor
            fbb.push_slot_always::<i32>(14, 1); // dilation_h_factor
        }
        Options::Pool2d { size } => {
            fbb.push_slot_always::<i8>(4, 0);
            fbb.push_slot_always::<i32>(6, *size);
            fbb.push_slot_always::<i32>(8, *size);
            fbb.push_slot_always::<i32>(10, *size); // filter_width
            fbb.push_slot_always::<i32>(12, *size); // filter_height
            fbb.push_slot_always::<i8>(14, Fused::None as i8);
        }
        Options::FullyConnected { fused } => {
            fbb.push_slot_always::<i8>(4, *fused as i8);
        }
        Options::Softmax => {
            fbb.push_slot_always::<f32>(4, 1.0); // beta
        }
        Options::Add | Options::Mul => {
            fbb.push_slot_always::<i8>(4, Fused::None as i8);
        }
        Options::Reshape { .. } => {
            if let Some(new_shape) = new_shape {
                fbb.push_slot_always(4, new_shape);
            }
        }
    }
    Some(fbb.end_table(start))
}

/// Serialize a lowered graph into a finished TFLite flatbuffer.
fn serialize(graph: &Graph, description: &str) -> Vec<u8> {
    let capacity = graph.buffers.iter().map(Vec::len).sum::<usize>() + 16 * 1024;
    let mut fbb = FlatBufferBuilder::with_capacity(capacity);

    let mut buffers = Vec::with_capacity(graph.buffers.len());
    for data in &graph.buffers {
        let data = (!data.is_empty()).then(|| fbb.create_vector(data.as_slice()));
        let start = fbb.start_table();
        if let Some(data) = data {
            fbb.push_slot_always(BUFFER_DATA, data);
        }
        buffers.push(fbb.end_table(start));
    }

    let mut tensors = Vec::with_capacity(graph.tensors.len());
    for tensor in &graph.tensors {
        let shape = fbb.create_vector(tensor.shape.as_slice());
        let name = fbb.create_string(&tensor.name);
        let start = fbb.start_table();
        fbb.push_slot_always(TENSOR_SHAPE, shape);
        fbb.push_slot_always::<i8>(TENSOR_TYPE, tensor.dtype as i8);
        fbb.push_slot_always::<u32>(TENSOR_BUFFER, tensor.buffer);
        fbb.push_slot_always(TENSOR_NAME, name);
        tensors.push(fbb.end_table(start));
    }

    let mut operators = Vec::with_capacity(graph.operators.len());
    for op in &graph.operators {
        let inputs = fbb.create_vector(op.inputs.as_slice());
        let outputs = fbb.create_vector(op.outputs.as_slice());
        let options = write_options(&mut fbb, &op.options);
        let start = fbb.start_table();
        fbb.push_slot_always::<u32>(OPERATOR_OPCODE_INDEX, graph.opcode_index(op.op));
        fbb.push_slot_always(OPERATOR_INPUTS, inputs);
        fbb.push_slot_always(OPERATOR_OUTPUTS, outputs);
        if let Some(options) = options {
            fbb.push_slot_always::<u8>(OPERATOR_OPTIONS_TYPE, op.options.union_type());
            fbb.push_slot_always(OPERATOR_OPTIONS, options);
        }
        operators.push(fbb.end_table(start));
    }

    let mut opcodes = Vec::with_capacity(graph.opcodes.len());
    for op in &graph.opcodes {
        let code = *op as i32;
        let start = fbb.start_table();
        fbb.push_slot_always::<i8>(OPCODE_DEPRECATED_BUILTIN, code.min(127) as i8);
        fbb.push_slot_always::<i32>(OPCODE_VERSION, 1);
        fbb.push_slot_always::<i32>(OPCODE_BUILTIN, code);
        opcodes.push(fbb.end_table(start));
    }

    let tensors = fbb.create_vector(tensors.as_slice());
    let operators = fbb.create_vector(operators.as_slice());
    let inputs = fbb.create_vector(graph.inputs.as_slice());
    let outputs = fbb.create_vector(graph.outputs.as_slice());
    let name = fbb.create_string("main");
    let start = fbb.start_table();
    fbb.push_slot_always(SUBGRAPH_TENSORS, tensors);
    fbb.push_slot_always(SUBGRAPH_INPUTS, inputs);
    fbb.push_slot_always(SUBGRAPH_OUTPUTS, outputs);
    fbb.push_slot_always(SUBGRAPH_OPERATORS, operators);
    fbb.push_slot_always(SUBGRAPH_NAME, name);
    let subgraph = fbb.end_table(start);

    let subgraphs = fbb.create_vector(&[subgraph]);
    let opcodes = fbb.create_vector(opcodes.as_slice());
    let buffers = fbb.create_vector(buffers.as_slice());
    let description = fbb.create_string(description);
    let start = fbb.start_table();
    fbb.push_slot_always::<u32>(MODEL_VERSION, SCHEMA_VERSION);
    fbb.push_slot_always(MODEL_OPERATOR_CODES, opcodes);
    fbb.push_slot_always(MODEL_SUBGRAPHS, subgraphs);
    fbb.push_slot_always(MODEL_DESCRIPTION, description);
    fbb.push_slot_always(MODEL_BUFFERS, buffers);
    let model = fbb.end_table(start);

    fbb.finish(model, Some(FILE_IDENTIFIER));
    fbb.finished_data().to_vec()
}

/// Encode `network` as a TFLite flatbuffer.
pub fn to_tflite_bytes(network: &Network) -> Result<Vec<u8>, MlError> {
    let graph = build_graph(network)?;
    debug!(
        tensors = graph.tensors.len(),
        operators = graph.operators.len(),
        "Lowered network to TFLite graph"
    );
    Ok(serialize(
        &graph,
        concat!("deepfly-ml ", env!("CARGO_PKG_VERSION")),
    ))
}

/// Write `network` to `path` as `model.tflite`; returns the bytes written.
pub fn write_tflite(network: &Network, path: &Path) -> Result<u64, MlError> {
    let bytes = to_tflite_bytes(network)?;
    std::fs::write(path, &bytes)?;
    Ok(bytes.len() as u64)
}
