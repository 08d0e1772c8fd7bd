use anyhow::{Result, bail};
use candle_core::{Module, Tensor};
use candle_nn::{Init, Linear, VarBuilder};
use either::Either;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Identity,
    Relu,
    Sigmoid,
    Softplus,
    Tanh,
}

impl FromStr for Activation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "identity" => Ok(Self::Identity),
            "relu" => Ok(Self::Relu),
            "sigmoid" => Ok(Self::Sigmoid),
            "softplus" => Ok(Self::Softplus),
            "tanh" => Ok(Self::Tanh),
            other => bail!(
                "unknown activation `{other}`, expected one of identity, relu, sigmoid, softplus, tanh"
            ),
        }
    }
}

impl Module for Activation {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Identity => Ok(xs.clone()),
            Self::Relu => xs.relu(),
            Self::Sigmoid => candle_nn::ops::sigmoid(xs),
            Self::Softplus => (xs.exp()? + 1.)?.log(),
            Self::Tanh => xs.tanh(),
        }
    }
}

/// How the weights of a linear layer are drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightInit {
    /// Kaiming uniform with `a = sqrt(5)`, the torch default for linear layers.
    KaimingUniform,
    XavierUniform,
    Normal,
}

impl FromStr for WeightInit {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "kaiming_uniform" => Ok(Self::KaimingUniform),
            "xavier_uniform" => Ok(Self::XavierUniform),
            "normal" => Ok(Self::Normal),
            other => bail!(
                "unknown weight_initialization_mode `{other}`, expected one of kaiming_uniform, xavier_uniform, normal"
            ),
        }
    }
}

impl WeightInit {
    fn weight_init(&self, fan_in: usize, fan_out: usize) -> Init {
        match self {
            Self::KaimingUniform => {
                let bound = 1. / (fan_in as f64).sqrt();
                Init::Uniform {
                    lo: -bound,
                    up: bound,
                }
            }
            Self::XavierUniform => {
                let bound = (6. / (fan_in + fan_out) as f64).sqrt();
                Init::Uniform {
                    lo: -bound,
                    up: bound,
                }
            }
            Self::Normal => Init::Randn {
                mean: 0.,
                stdev: 1.,
            },
        }
    }

    fn bias_init(fan_in: usize) -> Init {
        let bound = 1. / (fan_in as f64).sqrt();
        Init::Uniform {
            lo: -bound,
            up: bound,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinearLayer {
    layer: Linear,
}

impl LinearLayer {
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        init: WeightInit,
        vb: &VarBuilder,
        prefix: &str,
    ) -> Result<Self> {
        let vb = vb.pp(prefix);
        let weight = vb.get_with_hints(
            (out_dim, in_dim),
            "weight",
            init.weight_init(in_dim, out_dim),
        )?;
        let bias = vb.get_with_hints(out_dim, "bias", WeightInit::bias_init(in_dim))?;
        Ok(Self {
            layer: Linear::new(weight, Some(bias)),
        })
    }

    pub fn weight(&self) -> &Tensor {
        self.layer.weight()
    }
}

impl Module for LinearLayer {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        self.layer.forward(xs)
    }
}

#[derive(Debug, Clone)]
pub struct ThreadSafeLayer(pub Either<LinearLayer, Activation>);

impl ThreadSafeLayer {
    pub fn linear(linear: LinearLayer) -> Self {
        Self(Either::Left(linear))
    }

    pub fn activation(activation: Activation) -> Self {
        Self(Either::Right(activation))
    }
}

impl Module for ThreadSafeLayer {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match &self.0 {
            Either::Left(linear) => linear.forward(xs),
            Either::Right(activation) => activation.forward(xs),
        }
    }
}

#[derive(Default, Debug, Clone)]
pub struct ThreadSafeSequential {
    layers: Vec<ThreadSafeLayer>,
}

impl Module for ThreadSafeSequential {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let mut xs = xs.clone();
        for layer in self.layers.iter() {
            xs = layer.forward(&xs)?
        }
        Ok(xs)
    }
}

impl ThreadSafeSequential {
    pub fn add(mut self, layer: ThreadSafeLayer) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

/// MLP `input_dim -> hidden_sizes.. -> output_dim` with `activation` after every hidden
/// layer and a linear output.
pub fn build_sequential(
    input_dim: usize,
    hidden_sizes: &[usize],
    output_dim: usize,
    activation: Activation,
    init: WeightInit,
    vb: &VarBuilder,
    prefix: &str,
) -> Result<ThreadSafeSequential> {
    let mut last_dim = input_dim;
    let mut nn = ThreadSafeSequential::default();
    for (layer_idx, layer_size) in hidden_sizes.iter().enumerate() {
        let layer_pp = format!("{prefix}{layer_idx}");
        let layer = LinearLayer::new(last_dim, *layer_size, init, vb, &layer_pp)?;
        nn = nn
            .add(ThreadSafeLayer::linear(layer))
            .add(ThreadSafeLayer::activation(activation));
        last_dim = *layer_size;
    }
    let output_pp = format!("{prefix}{}", hidden_sizes.len());
    let output = LinearLayer::new(last_dim, output_dim, init, vb, &output_pp)?;
    Ok(nn.add(ThreadSafeLayer::linear(output)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn builds_mlp() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mlp = build_sequential(
            3,
            &[8, 8],
            2,
            Activation::Tanh,
            WeightInit::KaimingUniform,
            &vb,
            "value",
        )?;
        // two hidden layers with their activations and the output layer
        assert_eq!(mlp.len(), 5);
        assert_eq!(varmap.all_vars().len(), 6);
        let xs = Tensor::ones((4, 3), DType::F32, &Device::Cpu)?;
        assert_eq!(mlp.forward(&xs)?.dims(), &[4, 2]);
        Ok(())
    }

    #[test]
    fn weight_init_respects_bounds() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let layer = LinearLayer::new(16, 4, WeightInit::XavierUniform, &vb, "l")?;
        let bound = (6f32 / 20.).sqrt();
        let max = layer.weight().abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert!(max <= bound + 1e-6);
        Ok(())
    }

    #[test]
    fn activations() -> Result<()> {
        let xs = Tensor::new(&[-1f32, 0., 2.], &Device::Cpu)?;
        let relu: Vec<f32> = Activation::Relu.forward(&xs)?.to_vec1()?;
        assert_eq!(relu, vec![0., 0., 2.]);
        let tanh: Vec<f32> = Activation::Tanh.forward(&xs)?.to_vec1()?;
        assert!((tanh[2] - 2f32.tanh()).abs() < 1e-6);
        assert!("gelu".parse::<Activation>().is_err());
        assert_eq!("tanh".parse::<Activation>()?, Activation::Tanh);
        Ok(())
    }
}
