use std::fs::File;

use candle_core::Tensor;
use snafu::{ensure, ResultExt, Snafu};
use tracing::{debug, info, trace, warn};

use crate::config::CaptureConfig;
use crate::dequantize::{dequantize, DequantizeError};
use crate::encode::{encode_records, EncodeError, ValueSource};
use crate::select::{Architecture, LayerOutputSelector, TensorSelector};
use crate::sink::{CsvSink, RecordSink, SinkError};
use crate::stage::{
    descriptor_from_candle, stage_to_host, CandleAdapterError, CandleStore, StageError, TensorRef,
};
use crate::tensor::TensorDescriptor;

/// Capture errors.
///
/// None of these errors is recoverable: once a capture fails, the
/// driver rejects every further capture of the pass.
#[derive(Debug, Snafu)]
pub enum CaptureError {
    #[snafu(display("Capture was aborted by an earlier error"))]
    Aborted,

    #[snafu(display("Cannot describe candle tensor {name}"))]
    Candle {
        name: String,
        source: CandleAdapterError,
    },

    #[snafu(display("Cannot dequantize tensor"))]
    Dequantize { source: DequantizeError },

    #[snafu(display("Cannot encode tensor"))]
    Encode { source: EncodeError },

    #[snafu(display("Output sink is unavailable"))]
    Sink { source: SinkError },

    #[snafu(display("Cannot stage tensor"))]
    Stage { source: StageError },
}

/// Scheduler callback for graph evaluation.
///
/// The scheduler calls [`EvalCallback::decide`] for every node before its
/// data is computed. Only for nodes that were accepted,
/// [`EvalCallback::capture`] is called once the data is available.
pub trait EvalCallback {
    /// Whether the data of a tensor should be captured.
    ///
    /// This must not have side effects and must give the same answer
    /// when called repeatedly.
    fn decide(&self, descriptor: &TensorDescriptor) -> bool;

    /// Capture the materialized data of an accepted tensor.
    fn capture(&mut self, tensor: &TensorRef) -> Result<(), CaptureError>;

    /// Single entry point for schedulers that use one callback with a
    /// phase flag.
    ///
    /// * `tensor` - The tensor being evaluated.
    /// * `ask` - `true` when asking whether the tensor is wanted, `false`
    ///   when its data is available.
    ///
    /// Returns: in the ask phase, whether the tensor is wanted. Otherwise
    /// whether graph evaluation should continue, which is always the case.
    fn eval(&mut self, tensor: &TensorRef, ask: bool) -> Result<bool, CaptureError> {
        if ask {
            return Ok(self.decide(tensor.descriptor()));
        }

        self.capture(tensor)?;
        Ok(true)
    }
}

/// Totals of a capture pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PassSummary {
    /// Number of tensors that were captured, including skipped
    /// quantized tensors.
    pub n_tensors: usize,

    /// Number of tensors that records were written for.
    pub n_encoded: usize,

    /// Number of records written.
    pub n_records: usize,
}

/// Captures hidden states of one evaluation pass.
///
/// The driver owns all state of the pass: the selector, the tensor id
/// counter and the sink. Tensor ids are assigned in capture order and
/// advance once per captured tensor.
pub struct HiddenStateCapture<S> {
    selector: LayerOutputSelector,
    encode_quantized: bool,
    sink: S,
    next_id: usize,
    summary: PassSummary,
    aborted: bool,
}

impl HiddenStateCapture<CsvSink<File>> {
    /// Create a driver that writes to the output file of the
    /// configuration.
    ///
    /// Fails if the output file cannot be created or written.
    pub fn create(config: &CaptureConfig) -> Result<Self, CaptureError> {
        let sink = CsvSink::create(&config.output).context(SinkSnafu)?;
        Self::new(config, sink)
    }
}

impl<S> HiddenStateCapture<S>
where
    S: RecordSink,
{
    /// Create a driver that writes to `sink`.
    ///
    /// The sink is prepared immediately, so that an unusable sink is
    /// reported before evaluation starts.
    pub fn new(config: &CaptureConfig, mut sink: S) -> Result<Self, CaptureError> {
        sink.begin().context(SinkSnafu)?;

        Ok(HiddenStateCapture {
            selector: LayerOutputSelector::new(config.architecture),
            encode_quantized: config.encode_quantized,
            sink,
            next_id: 0,
            summary: PassSummary::default(),
            aborted: false,
        })
    }

    /// Architecture used for tensor selection.
    pub fn architecture(&self) -> Architecture {
        self.selector.architecture()
    }

    /// Id that the next captured tensor gets.
    pub fn next_id(&self) -> usize {
        self.next_id
    }

    /// Totals so far.
    pub fn summary(&self) -> PassSummary {
        self.summary
    }

    /// Run both callback phases for an eagerly computed candle tensor.
    ///
    /// * `name` - Tensor name.
    /// * `operation` - Label of the operation that produced the tensor.
    /// * `tensor` - The computed tensor.
    ///
    /// Returns: whether the tensor was captured.
    pub fn observe(
        &mut self,
        name: &str,
        operation: &str,
        tensor: &Tensor,
    ) -> Result<bool, CaptureError> {
        if !self.selector.accepts(name) {
            trace!(tensor = name, "rejected");
            return Ok(false);
        }

        let descriptor = match descriptor_from_candle(name, operation, tensor) {
            Ok(descriptor) => descriptor,
            Err(source) => {
                self.aborted = true;
                return Err(CaptureError::Candle {
                    name: name.to_string(),
                    source,
                });
            }
        };

        let store = CandleStore::new(tensor);
        if store.is_device() {
            debug!(tensor = name, device = ?tensor.device(), "tensor is not on the CPU");
        }

        self.capture(&TensorRef::new(&descriptor, &store))?;

        Ok(true)
    }

    /// Finish the pass.
    ///
    /// Flushes the sink and returns it together with the pass totals.
    pub fn finish(mut self) -> Result<(S, PassSummary), CaptureError> {
        ensure!(!self.aborted, AbortedSnafu);
        self.sink.finish().context(SinkSnafu)?;

        info!(
            n_tensors = self.summary.n_tensors,
            n_encoded = self.summary.n_encoded,
            n_records = self.summary.n_records,
            "hidden state capture finished"
        );

        Ok((self.sink, self.summary))
    }

    fn capture_tensor(&mut self, tensor: &TensorRef) -> Result<(), CaptureError> {
        let descriptor = tensor.descriptor();
        let encoding = descriptor.encoding();

        let id = self.next_id;
        self.next_id += 1;
        self.summary.n_tensors += 1;

        if encoding.is_quantized() && !self.encode_quantized {
            warn!(
                id,
                tensor = descriptor.name(),
                %encoding,
                "skipping quantized tensor"
            );
            return Ok(());
        }

        let buffer = stage_to_host(descriptor, tensor.store())
            .context(StageSnafu)?;

        let n_records = match dequantize(descriptor, &buffer).context(DequantizeSnafu)? {
            Some(values) => {
                let source = ValueSource::dense(descriptor, &values).context(EncodeSnafu)?;
                encode_records(descriptor, &source, id, &mut self.sink)
                    .context(EncodeSnafu)?
            }
            None => {
                let source = ValueSource::strided(descriptor, &buffer)
                    .context(EncodeSnafu)?;
                encode_records(descriptor, &source, id, &mut self.sink)
                    .context(EncodeSnafu)?
            }
        };

        debug!(
            id,
            tensor = descriptor.name(),
            %encoding,
            n_records,
            "captured tensor"
        );

        self.summary.n_encoded += 1;
        self.summary.n_records += n_records;

        Ok(())
    }
}

impl<S> EvalCallback for HiddenStateCapture<S>
where
    S: RecordSink,
{
    fn decide(&self, descriptor: &TensorDescriptor) -> bool {
        self.selector.accepts(descriptor.name())
    }

    fn capture(&mut self, tensor: &TensorRef) -> Result<(), CaptureError> {
        ensure!(!self.aborted, AbortedSnafu);

        let result = self.capture_tensor(tensor);
        if result.is_err() {
            self.aborted = true;
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Tensor};
    use snafu::{report, ResultExt, Whatever};

    use super::{CaptureError, EvalCallback, HiddenStateCapture, PassSummary};
    use crate::config::CaptureConfig;
    use crate::select::Architecture;
    use crate::sink::CsvSink;
    use crate::stage::TensorRef;
    use crate::tensor::{Encoding, TensorDescriptor};
    use crate::util::device::tests::test_devices;
    use crate::util::tests::{pseudo_random, DeviceMemory, RecordingSink};

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn recording_driver(config: &CaptureConfig) -> HiddenStateCapture<RecordingSink> {
        HiddenStateCapture::new(config, RecordingSink::default()).unwrap()
    }

    /// Run both phases like a scheduler does.
    fn visit(
        driver: &mut impl EvalCallback,
        descriptor: &TensorDescriptor,
        data: &DeviceMemory,
    ) -> Result<bool, CaptureError> {
        let tensor = TensorRef::new(descriptor, data);
        if !driver.eval(&tensor, true)? {
            return Ok(false);
        }
        driver.eval(&tensor, false)
    }

    #[test]
    #[report]
    fn layer_output_is_written_as_table() -> Result<(), Whatever> {
        let descriptor =
            TensorDescriptor::contiguous("l_out-3", Encoding::F32, "ADD", [4, 1, 1, 1]);
        let data = f32_bytes(&[1.0, 2.0, 3.0, 4.0]);

        let sink = CsvSink::new(Vec::new());
        let mut driver = HiddenStateCapture::new(&CaptureConfig::default(), sink)
            .whatever_context("Cannot create driver")?;
        let tensor = TensorRef::new(&descriptor, &data);
        let wanted = driver.eval(&tensor, true).whatever_context("Ask failed")?;
        assert!(wanted);
        let proceed = driver
            .eval(&tensor, false)
            .whatever_context("Capture failed")?;
        assert!(proceed);

        let (sink, summary) = driver.finish().whatever_context("Cannot finish pass")?;
        let output = String::from_utf8(sink.into_inner().whatever_context("Cannot flush")?)
            .whatever_context("Output is not UTF-8")?;

        assert_eq!(
            output,
            "ID,name,type,operation,full_ne,curr_ne,value\n\
             0,l_out-3,f32,ADD,\"{4, 1, 1, 1}\",\"{0, 0, 0, 0}\",1.0\n\
             0,l_out-3,f32,ADD,\"{4, 1, 1, 1}\",\"{1, 0, 0, 0}\",2.0\n\
             0,l_out-3,f32,ADD,\"{4, 1, 1, 1}\",\"{2, 0, 0, 0}\",3.0\n\
             0,l_out-3,f32,ADD,\"{4, 1, 1, 1}\",\"{3, 0, 0, 0}\",4.0\n"
        );
        assert_eq!(
            summary,
            PassSummary {
                n_tensors: 1,
                n_encoded: 1,
                n_records: 4
            }
        );

        Ok(())
    }

    #[test]
    #[report]
    fn rejected_tensor_is_never_transferred() -> Result<(), Whatever> {
        let mut driver = recording_driver(&CaptureConfig::default());
        let descriptor =
            TensorDescriptor::contiguous("attn_out", Encoding::F32, "MUL_MAT", [4, 1, 1, 1]);
        let data = DeviceMemory::new(f32_bytes(&[1.0; 4]));

        let captured = visit(&mut driver, &descriptor, &data)
            .whatever_context("Cannot visit tensor")?;

        assert!(!captured);
        assert_eq!(data.transfers(), 0);
        assert_eq!(driver.next_id(), 0);
        let (sink, _) = driver.finish().whatever_context("Cannot finish pass")?;
        assert!(sink.records.is_empty());

        Ok(())
    }

    #[test]
    #[report]
    fn device_tensors_are_transferred_once() -> Result<(), Whatever> {
        let mut driver = recording_driver(&CaptureConfig::default());
        let descriptor =
            TensorDescriptor::contiguous("l_out-0", Encoding::F32, "ADD", [3, 2, 1, 1]);
        let values = pseudo_random(6);
        let data = DeviceMemory::new(f32_bytes(&values));

        visit(&mut driver, &descriptor, &data)
            .whatever_context("Cannot visit tensor")?;

        assert_eq!(data.transfers(), 1);
        let (sink, _) = driver.finish().whatever_context("Cannot finish pass")?;
        assert_eq!(sink.values(), values);

        Ok(())
    }

    #[test]
    #[report]
    fn ids_advance_per_tensor() -> Result<(), Whatever> {
        let mut driver = recording_driver(&CaptureConfig::default());

        for (layer, n) in [(0, 2), (1, 3), (2, 1)] {
            let descriptor = TensorDescriptor::contiguous(
                format!("l_out-{layer}"),
                Encoding::F32,
                "ADD",
                [n, 1, 1, 1],
            );
            let skipped = TensorDescriptor::contiguous(
                format!("ffn_out-{layer}"),
                Encoding::F32,
                "ADD",
                [n, 1, 1, 1],
            );
            let data = DeviceMemory::new(f32_bytes(&vec![layer as f32; n]));
            visit(&mut driver, &skipped, &data)
                .whatever_context("Cannot visit tensor")?;
            visit(&mut driver, &descriptor, &data)
                .whatever_context("Cannot visit tensor")?;
        }

        let (sink, summary) = driver.finish().whatever_context("Cannot finish pass")?;
        let ids: Vec<usize> = sink.records.iter().map(|record| record.id).collect();
        assert_eq!(ids, vec![0, 0, 1, 1, 1, 2]);
        assert_eq!(summary.n_records, 6);

        Ok(())
    }

    #[test]
    #[report]
    fn quantized_tensors_are_dequantized() -> Result<(), Whatever> {
        let mut driver = recording_driver(&CaptureConfig::default());
        let descriptor =
            TensorDescriptor::contiguous("l_out-0", Encoding::Q8_0, "ADD", [32, 1, 1, 1]);
        let mut block = half::f16::from_f32(2.0).to_le_bytes().to_vec();
        block.extend((0..32).map(|q| q as u8));

        let tensor = TensorRef::new(&descriptor, &block);
        assert!(driver.decide(&descriptor));
        driver.capture(&tensor)
            .whatever_context("Cannot capture tensor")?;

        let (sink, summary) = driver.finish().whatever_context("Cannot finish pass")?;
        let expected: Vec<f32> = (0..32).map(|q| q as f32 * 2.0).collect();
        assert_eq!(sink.values(), expected);
        assert!(sink
            .records
            .iter()
            .all(|record| record.encoding == Encoding::Q8_0));
        assert_eq!(summary.n_encoded, 1);

        Ok(())
    }

    #[test]
    #[report]
    fn quantized_strides_are_ignored() -> Result<(), Whatever> {
        let mut driver = recording_driver(&CaptureConfig::default());

        // Rows are 40 bytes apart, but quantized data is read as densely
        // packed blocks.
        let descriptor = TensorDescriptor::new(
            "l_out-0",
            Encoding::Q8_0,
            "ADD",
            [32, 2, 1, 1],
            [34, 40, 80, 80],
        );
        assert_eq!(descriptor.n_bytes(), 74);

        let mut bytes = Vec::new();
        for scale in [1.0f32, -2.0] {
            bytes.extend(half::f16::from_f32(scale).to_le_bytes());
            bytes.extend((0..32).map(|q| q as u8));
        }
        bytes.extend([0xff; 6]);
        let data = DeviceMemory::new(bytes);

        visit(&mut driver, &descriptor, &data)
            .whatever_context("Cannot visit tensor")?;
        assert_eq!(data.transfers(), 1);

        let (sink, _) = driver.finish().whatever_context("Cannot finish pass")?;
        let expected: Vec<f32> = [1.0f32, -2.0]
            .into_iter()
            .flat_map(|scale| (0..32).map(move |q| q as f32 * scale))
            .collect();
        assert_eq!(sink.values(), expected);
        assert_eq!(sink.coords()[32], [0, 1, 0, 0]);

        Ok(())
    }

    #[test]
    #[report]
    fn quantized_tensors_can_be_skipped() -> Result<(), Whatever> {
        let config = CaptureConfig::default().encode_quantized(false);
        let mut driver = recording_driver(&config);

        let quantized =
            TensorDescriptor::contiguous("l_out-0", Encoding::Q4_0, "ADD", [32, 1, 1, 1]);
        let quantized_data = DeviceMemory::new(vec![0; 18]);
        visit(&mut driver, &quantized, &quantized_data)
            .whatever_context("Cannot visit tensor")?;
        assert_eq!(quantized_data.transfers(), 0);

        let canonical = TensorDescriptor::contiguous("l_out-1", Encoding::F32, "ADD", [1, 1, 1, 1]);
        let canonical_data = DeviceMemory::new(f32_bytes(&[5.0]));
        visit(&mut driver, &canonical, &canonical_data)
            .whatever_context("Cannot visit tensor")?;

        let (sink, summary) = driver.finish().whatever_context("Cannot finish pass")?;
        assert_eq!(sink.records.len(), 1);
        assert_eq!(sink.records[0].id, 1);
        assert_eq!(
            summary,
            PassSummary {
                n_tensors: 2,
                n_encoded: 1,
                n_records: 1
            }
        );

        Ok(())
    }

    #[test]
    fn wavtokenizer_outputs_are_selected() {
        let generic = recording_driver(&CaptureConfig::default());
        let wavtokenizer =
            recording_driver(&CaptureConfig::default().architecture(Architecture::WavTokenizerDec));

        let posnet = TensorDescriptor::contiguous("posnet_out", Encoding::F32, "ADD", [1, 1, 1, 1]);
        assert!(!generic.decide(&posnet));
        assert!(wavtokenizer.decide(&posnet));
        assert_eq!(wavtokenizer.architecture(), Architecture::WavTokenizerDec);
    }

    #[test]
    fn failed_transfer_aborts_the_pass() {
        let mut driver = recording_driver(&CaptureConfig::default());
        let descriptor =
            TensorDescriptor::contiguous("l_out-0", Encoding::F32, "ADD", [2, 1, 1, 1]);

        let failing = DeviceMemory::failing();
        assert!(matches!(
            visit(&mut driver, &descriptor, &failing),
            Err(CaptureError::Stage { .. })
        ));

        let healthy = DeviceMemory::new(f32_bytes(&[1.0, 2.0]));
        assert!(matches!(
            visit(&mut driver, &descriptor, &healthy),
            Err(CaptureError::Aborted)
        ));
        assert_eq!(healthy.transfers(), 0);
        assert!(matches!(driver.finish(), Err(CaptureError::Aborted)));
    }

    #[test]
    fn unwritable_output_fails_before_evaluation() {
        let config = CaptureConfig::default().output(
            std::env::temp_dir()
                .join("hidden-states-missing-dir")
                .join("out.csv"),
        );
        assert!(matches!(
            HiddenStateCapture::create(&config),
            Err(CaptureError::Sink { .. })
        ));
    }

    #[test]
    #[report]
    fn candle_tensors_are_observed() -> Result<(), Whatever> {
        for device in test_devices() {
            let mut driver = recording_driver(&CaptureConfig::default());

            let hidden = Tensor::arange(0f32, 12f32, &device)
                .and_then(|t| t.reshape((1, 3, 4)))
                .whatever_context("Cannot create tensor")?;
            let attn = hidden
                .to_dtype(DType::F16)
                .whatever_context("Cannot convert tensor")?;
            let ids = Tensor::zeros(3, DType::U32, &device)
                .whatever_context("Cannot create ids")?;

            assert!(!driver
                .observe("inp_tokens", "GET_ROWS", &ids)
                .whatever_context("Cannot observe ids")?);
            assert!(!driver
                .observe("attn_out-0", "MUL_MAT", &attn)
                .whatever_context("Cannot observe attention")?);
            assert!(driver
                .observe("l_out-0", "ADD", &hidden)
                .whatever_context("Cannot observe layer output")?);

            let (sink, _) = driver.finish().whatever_context("Cannot finish pass")?;
            assert_eq!(sink.records.len(), 12);
            assert!(sink
                .records
                .iter()
                .all(|record| record.shape == [4, 3, 1, 1]));
            assert_eq!(sink.records[5].coord, [1, 1, 0, 0]);
            assert_eq!(sink.values(), (0..12).map(|v| v as f32).collect::<Vec<_>>());
        }

        Ok(())
    }

    #[test]
    fn unsupported_candle_tensor_aborts_when_selected() {
        let mut driver = recording_driver(&CaptureConfig::default());
        let ids = Tensor::zeros(3, DType::U32, &candle_core::Device::Cpu)
            .unwrap();
        assert!(matches!(
            driver.observe("l_out-0", "GET_ROWS", &ids),
            Err(CaptureError::Candle { .. })
        ));
        assert!(matches!(driver.finish(), Err(CaptureError::Aborted)));
    }
}
