//! TensorFlow SavedModel backend.
//!
//! Exported models take an NHWC float batch on `serving_default_inp` and return NHWC
//! class scores from `StatefulPartitionedCall`.

use crate::error::{Result, SegError};
use crate::predictor::{ModelOutput, Predictor};
use ndarray::{Array4, ArrayView4};
use std::path::Path;
use tensorflow::{Graph, SavedModelBundle, SessionOptions, SessionRunArgs, Status, Tensor};

const MODEL_INP_NAME: &str = "serving_default_inp";
const MODEL_OUT_NAME: &str = "StatefulPartitionedCall";

fn tf_err(status: Status) -> SegError {
    SegError::Inference(status.to_string().into())
}

pub struct SavedModelPredictor {
    graph: Graph,
    bundle: SavedModelBundle,
}

impl SavedModelPredictor {
    pub fn load(model_dir: &Path) -> Result<Self> {
        let mut graph = Graph::new();
        let bundle =
            SavedModelBundle::load(&SessionOptions::new(), &["serve"], &mut graph, model_dir)
                .map_err(tf_err)?;
        // fail at startup rather than on the first crop
        graph.operation_by_name_required(MODEL_INP_NAME).map_err(tf_err)?;
        graph.operation_by_name_required(MODEL_OUT_NAME).map_err(tf_err)?;
        Ok(Self { graph, bundle })
    }
}

impl Predictor for SavedModelPredictor {
    fn infer(&self, batch: ArrayView4<'_, f32>) -> Result<ModelOutput> {
        let input_op = self
            .graph
            .operation_by_name_required(MODEL_INP_NAME)
            .map_err(tf_err)?;
        let output_op = self
            .graph
            .operation_by_name_required(MODEL_OUT_NAME)
            .map_err(tf_err)?;

        // NCHW -> NHWC
        let nhwc = batch.permuted_axes([0, 2, 3, 1]);
        let nhwc = nhwc.as_standard_layout();
        let (n, h, w, c) = nhwc.dim();
        let values = nhwc
            .as_slice()
            .ok_or_else(|| SegError::invalid_input("non-contiguous model input"))?;
        let input_tensor = Tensor::<f32>::new(&[n as u64, h as u64, w as u64, c as u64])
            .with_values(values)
            .map_err(tf_err)?;

        let mut run_args = SessionRunArgs::new();
        run_args.add_feed(&input_op, 0, &input_tensor);
        let out_token = run_args.request_fetch(&output_op, 0);
        self.bundle.session.run(&mut run_args).map_err(tf_err)?;

        let pred: Tensor<f32> = run_args.fetch(out_token).map_err(tf_err)?;
        let dims: Vec<usize> = pred.dims().iter().map(|&d| d as usize).collect();
        let [n_out, h_out, w_out, n_cls] = dims[..] else {
            return Err(SegError::invalid_input(format!(
                "expected a 4-D model output, got {dims:?}"
            )));
        };
        let ary_out = Array4::from_shape_vec((n_out, h_out, w_out, n_cls), pred.to_vec())?;
        Ok(ary_out
            .permuted_axes([0, 3, 1, 2])
            .as_standard_layout()
            .into_owned()
            .into())
    }
}
