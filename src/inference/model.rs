// Dense feed-forward classifier stored as JSON.
//
// {"layers":[{"weights":[[w00,w01,..],..],"bias":[..],"activation":"leaky_relu"},..]}
//
// `weights` is indexed [input][output]. The network's class for a row is the
// argmax of the last layer's activations.

use anyhow::Context;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use super::{Classifier, ModelLoader};

const LEAKY_SLOPE: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Linear,
    Relu,
    LeakyRelu,
    Softmax,
}

// On-disk layer shape; nested rows keep the artifacts readable.
#[derive(Serialize, Deserialize)]
struct LayerFile {
    weights: Vec<Vec<f64>>,
    bias: Vec<f64>,
    activation: Activation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "LayerFile", into = "LayerFile")]
pub struct DenseLayer {
    pub weights: Array2<f64>,
    pub bias: Array1<f64>,
    pub activation: Activation,
}

impl TryFrom<LayerFile> for DenseLayer {
    type Error = anyhow::Error;

    fn try_from(file: LayerFile) -> anyhow::Result<Self> {
        let outputs = file.bias.len();
        let inputs = file.weights.len();
        anyhow::ensure!(
            file.weights.iter().all(|row| row.len() == outputs),
            "weight rows must have {outputs} columns"
        );
        let flat: Vec<f64> = file.weights.into_iter().flatten().collect();
        let weights = Array2::from_shape_vec((inputs, outputs), flat).context("weight matrix")?;
        Ok(Self { weights, bias: Array1::from(file.bias), activation: file.activation })
    }
}

impl From<DenseLayer> for LayerFile {
    fn from(layer: DenseLayer) -> Self {
        Self {
            weights: layer.weights.rows().into_iter().map(|r| r.to_vec()).collect(),
            bias: layer.bias.to_vec(),
            activation: layer.activation,
        }
    }
}

impl DenseLayer {
    pub fn new(weights: Array2<f64>, bias: Array1<f64>, activation: Activation) -> Self {
        Self { weights, bias, activation }
    }

    fn inputs(&self) -> usize {
        self.weights.nrows()
    }

    fn outputs(&self) -> usize {
        self.bias.len()
    }

    fn forward(&self, input: ArrayView2<f64>) -> Array2<f64> {
        let mut out = input.dot(&self.weights) + &self.bias;
        match self.activation {
            Activation::Linear => {}
            Activation::Relu => out.mapv_inplace(|v| v.max(0.0)),
            Activation::LeakyRelu => out.mapv_inplace(|v| if v < 0.0 { v * LEAKY_SLOPE } else { v }),
            Activation::Softmax => {
                for mut row in out.rows_mut() {
                    let max = row.fold(f64::NEG_INFINITY, |m, v| m.max(*v));
                    row.mapv_inplace(|v| (v - max).exp());
                    let sum = row.sum();
                    row /= sum;
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseNetwork {
    pub layers: Vec<DenseLayer>,
}

impl DenseNetwork {
    pub fn from_slice(bytes: &[u8]) -> anyhow::Result<Self> {
        let network: DenseNetwork = serde_json::from_slice(bytes)?;
        network.validate()?;
        Ok(network)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.layers.is_empty(), "network has no layers");
        for (i, layer) in self.layers.iter().enumerate() {
            anyhow::ensure!(layer.outputs() > 0, "layer {i} has no outputs");
            anyhow::ensure!(
                layer.weights.ncols() == layer.outputs(),
                "layer {i}: weight matrix must have {} columns",
                layer.outputs()
            );
            if i > 0 {
                let prev = self.layers[i - 1].outputs();
                anyhow::ensure!(
                    layer.inputs() == prev,
                    "layer {i} expects {} inputs but layer {} emits {prev}",
                    layer.inputs(),
                    i - 1
                );
            }
        }
        Ok(())
    }

    pub fn input_width(&self) -> usize {
        self.layers.first().map_or(0, DenseLayer::inputs)
    }

    pub fn classes(&self) -> usize {
        self.layers.last().map_or(0, DenseLayer::outputs)
    }

    pub fn forward(&self, rows: ArrayView2<f64>) -> Array2<f64> {
        self.layers.iter().fold(rows.to_owned(), |x, layer| layer.forward(x.view()))
    }
}

fn argmax(values: ArrayView1<f64>) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = i;
        }
    }
    best
}

impl Classifier for DenseNetwork {
    fn classes(&self) -> usize {
        DenseNetwork::classes(self)
    }

    fn predict(&self, rows: ArrayView2<f64>) -> anyhow::Result<Vec<usize>> {
        if rows.nrows() == 0 {
            return Ok(Vec::new());
        }
        let width = self.input_width();
        anyhow::ensure!(
            rows.ncols() == width,
            "rows have {} features, model expects {width}",
            rows.ncols()
        );
        Ok(self.forward(rows).axis_iter(Axis(0)).map(argmax).collect())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DenseModelLoader;

impl ModelLoader for DenseModelLoader {
    fn extension(&self) -> &str {
        "json"
    }

    fn load(&self, bytes: &[u8]) -> anyhow::Result<Box<dyn Classifier>> {
        Ok(Box::new(DenseNetwork::from_slice(bytes)?))
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// Single softmax layer whose winning class is chosen by `bias` alone.
    pub fn constant(inputs: usize, class: usize) -> DenseNetwork {
        let mut bias = Array1::zeros(3);
        bias[class] = 10.0;
        DenseNetwork {
            layers: vec![DenseLayer::new(Array2::zeros((inputs, 3)), bias, Activation::Softmax)],
        }
    }

    pub fn to_bytes(network: &DenseNetwork) -> Vec<u8> {
        serde_json::to_vec(network).unwrap()
    }
}
