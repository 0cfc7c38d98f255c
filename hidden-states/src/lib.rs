//! Capture intermediate tensors of a computation graph during a forward
//! pass and write every element, with its coordinate, to a flat table.
//!
//! The graph scheduler drives capture through [`driver::EvalCallback`]:
//! it first asks whether a node's output is wanted and, if so, calls
//! back once the output is materialized. Accepted tensors are staged to
//! host memory, dequantized when stored in a ggml block encoding, and
//! streamed element by element to a [`sink::RecordSink`].

pub mod config;
pub mod dequantize;
pub mod driver;
pub mod encode;
pub mod error;
pub mod select;
pub mod sink;
pub mod stage;
pub mod tensor;
