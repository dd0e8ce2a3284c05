//! Deterministic in-memory model fixtures shared by the test suite.
//!
//! `DenseHeadLoader` stands in for a real artifact loader: it hands out
//! handles for a softmax cross-entropy head over an identity feature
//! extractor, with analytically computed gradients and an SGD optimizer with
//! optional momentum. Every handle derives its tensor metadata the same way a
//! real graph would, so the adapters exercise their introspection paths too.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use ndarray::{ArrayView1, ArrayView2, Axis};

use crate::{
    EngineErr, Result,
    model::{ModelLoader, RawModel},
};

#[derive(Clone, Copy, Debug)]
struct Config {
    features: usize,
    classes: usize,
    batch: usize,
    learning_rate: f32,
    momentum: Option<f32>,
    fail_extract: bool,
}

/// Records how many trainer graphs execute concurrently.
#[derive(Debug, Default)]
struct TrainProbe {
    in_flight: AtomicUsize,
    max: AtomicUsize,
}

impl TrainProbe {
    fn enter(&self) -> ProbeGuard<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        ProbeGuard(self)
    }
}

struct ProbeGuard<'a>(&'a TrainProbe);

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone, Copy)]
#[derive(Debug)]
enum Role {
    Initializer,
    Base,
    Trainer,
    Inference,
    Optimizer,
}

/// One fixture graph handle.
#[derive(Debug)]
pub(crate) struct DenseHandle {
    role: Role,
    cfg: Config,
    input_shapes: Vec<Vec<usize>>,
    output_shapes: Vec<Vec<usize>>,
    probe: Arc<TrainProbe>,
}

impl RawModel for DenseHandle {
    fn input_count(&self) -> usize {
        self.input_shapes.len()
    }

    fn output_count(&self) -> usize {
        self.output_shapes.len()
    }

    fn input_shape(&self, index: usize) -> &[usize] {
        &self.input_shapes[index]
    }

    fn output_shape(&self, index: usize) -> &[usize] {
        &self.output_shapes[index]
    }

    fn run(&mut self, inputs: &[&[f32]], outputs: &mut [&mut [f32]]) -> Result<()> {
        match self.role {
            Role::Initializer => {
                for output in outputs.iter_mut() {
                    output.fill(0.0);
                }
            }
            Role::Base => {
                if self.cfg.fail_extract {
                    return Err(EngineErr::Model {
                        stage: "feature-extractor",
                        detail: "injected extraction failure".to_owned(),
                    });
                }
                outputs[0].copy_from_slice(inputs[0]);
            }
            Role::Trainer => {
                let _guard = self.probe.enter();
                run_trainer(&self.cfg, inputs, outputs);
            }
            Role::Inference => run_inference(&self.cfg, inputs, outputs),
            Role::Optimizer => run_optimizer(&self.cfg, inputs, outputs),
        }

        Ok(())
    }
}

/// Softmax cross-entropy over a batch: loss plus analytic gradients.
fn run_trainer(cfg: &Config, inputs: &[&[f32]], outputs: &mut [&mut [f32]]) {
    let (b, f, c) = (cfg.batch, cfg.features, cfg.classes);

    let x = ArrayView2::from_shape((b, f), inputs[0]).unwrap();
    let y = ArrayView2::from_shape((b, c), inputs[1]).unwrap();
    let w = ArrayView2::from_shape((f, c), inputs[2]).unwrap();
    let bias = ArrayView1::from(inputs[3]);

    let mut probs = x.dot(&w);
    for mut row in probs.rows_mut() {
        row += &bias;
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }

    let loss = -(&y * &probs.mapv(f32::ln)).sum() / b as f32;
    let delta = (&probs - &y) / b as f32;
    let grad_w = x.t().dot(&delta);
    let grad_b = delta.sum_axis(Axis(0));

    outputs[0][0] = loss;
    for (dst, src) in outputs[1].iter_mut().zip(grad_w.iter()) {
        *dst = *src;
    }
    for (dst, src) in outputs[2].iter_mut().zip(grad_b.iter()) {
        *dst = *src;
    }
}

/// Softmax posterior for a single bottleneck.
fn run_inference(cfg: &Config, inputs: &[&[f32]], outputs: &mut [&mut [f32]]) {
    let (f, c) = (cfg.features, cfg.classes);

    let x = ArrayView1::from(inputs[0]);
    let w = ArrayView2::from_shape((f, c), inputs[1]).unwrap();
    let bias = ArrayView1::from(inputs[2]);

    let mut logits = x.dot(&w) + &bias;
    let max = logits.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
    logits.mapv_inplace(|v| (v - max).exp());
    let sum = logits.sum();

    for (dst, src) in outputs[0].iter_mut().zip(logits.iter()) {
        *dst = src / sum;
    }
}

/// SGD step, with an optional velocity state per parameter tensor.
fn run_optimizer(cfg: &Config, inputs: &[&[f32]], outputs: &mut [&mut [f32]]) {
    let lr = cfg.learning_rate;

    match cfg.momentum {
        None => {
            for i in 0..2 {
                let (w, g) = (inputs[i], inputs[2 + i]);
                for j in 0..w.len() {
                    outputs[i][j] = w[j] - lr * g[j];
                }
            }
        }
        Some(m) => {
            let (new_w, new_v) = outputs.split_at_mut(2);
            for i in 0..2 {
                let (w, g, v) = (inputs[i], inputs[2 + i], inputs[4 + i]);
                for j in 0..w.len() {
                    let vel = m * v[j] + g[j];
                    new_v[i][j] = vel;
                    new_w[i][j] = w[j] - lr * vel;
                }
            }
        }
    }
}

/// A deterministic stand-in for an artifact loader.
pub(crate) struct DenseHeadLoader {
    cfg: Config,
    probe: Arc<TrainProbe>,
}

impl DenseHeadLoader {
    pub(crate) fn new(features: usize, classes: usize, batch: usize) -> Self {
        Self {
            cfg: Config {
                features,
                classes,
                batch,
                learning_rate: 0.1,
                momentum: None,
                fail_extract: false,
            },
            probe: Arc::new(TrainProbe::default()),
        }
    }

    pub(crate) fn with_learning_rate(mut self, learning_rate: f32) -> Self {
        self.cfg.learning_rate = learning_rate;
        self
    }

    pub(crate) fn with_momentum(mut self, momentum: f32) -> Self {
        self.cfg.momentum = Some(momentum);
        self
    }

    pub(crate) fn with_failing_base(mut self) -> Self {
        self.cfg.fail_extract = true;
        self
    }

    /// The highest number of trainer graphs ever observed running at once.
    pub(crate) fn max_concurrent_trains(&self) -> usize {
        self.probe.max.load(Ordering::SeqCst)
    }

    fn handle(&self, role: Role, inputs: Vec<Vec<usize>>, outputs: Vec<Vec<usize>>) -> DenseHandle {
        DenseHandle {
            role,
            cfg: self.cfg,
            input_shapes: inputs,
            output_shapes: outputs,
            probe: Arc::clone(&self.probe),
        }
    }
}

impl ModelLoader for DenseHeadLoader {
    type Handle = DenseHandle;

    fn load_initializer(&self) -> Result<Self::Handle> {
        let Config {
            features, classes, ..
        } = self.cfg;
        Ok(self.handle(
            Role::Initializer,
            vec![],
            vec![vec![features, classes], vec![classes]],
        ))
    }

    fn load_base(&self) -> Result<Self::Handle> {
        let features = self.cfg.features;
        Ok(self.handle(Role::Base, vec![vec![features]], vec![vec![features]]))
    }

    fn load_trainer(&self) -> Result<Self::Handle> {
        let Config {
            features,
            classes,
            batch,
            ..
        } = self.cfg;
        Ok(self.handle(
            Role::Trainer,
            vec![
                vec![batch, features],
                vec![batch, classes],
                vec![features, classes],
                vec![classes],
            ],
            vec![vec![1], vec![features, classes], vec![classes]],
        ))
    }

    fn load_inference(&self) -> Result<Self::Handle> {
        let Config {
            features, classes, ..
        } = self.cfg;
        Ok(self.handle(
            Role::Inference,
            vec![vec![features], vec![features, classes], vec![classes]],
            vec![vec![classes]],
        ))
    }

    fn load_optimizer(&self) -> Result<Self::Handle> {
        let Config {
            features, classes, ..
        } = self.cfg;
        let param_shapes = [vec![features, classes], vec![classes]];

        let mut inputs: Vec<Vec<usize>> = Vec::new();
        inputs.extend(param_shapes.iter().cloned());
        inputs.extend(param_shapes.iter().cloned());
        let mut outputs: Vec<Vec<usize>> = param_shapes.to_vec();
        if self.cfg.momentum.is_some() {
            inputs.extend(param_shapes.iter().cloned());
            outputs.extend(param_shapes.iter().cloned());
        }

        Ok(self.handle(Role::Optimizer, inputs, outputs))
    }
}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng, rngs::StdRng};

    use super::*;
    use crate::stages::HeadTrainer;

    const FEATURES: usize = 8;
    const CLASSES: usize = 5;
    const BATCH: usize = 3;
    const DELTA: f32 = 1e-3;

    fn random_buffer(rng: &mut StdRng, len: usize) -> Box<[f32]> {
        (0..len).map(|_| rng.random::<f32>() - 0.5).collect()
    }

    /// Finite-difference check of the analytic gradients: perturbing one
    /// parameter element must move the loss by roughly delta * gradient.
    #[test]
    fn test_gradients_match_finite_differences() {
        let mut rng = StdRng::seed_from_u64(7);
        let loader = DenseHeadLoader::new(FEATURES, CLASSES, BATCH);
        let trainer = HeadTrainer::new(loader.load_trainer().unwrap()).unwrap();

        let features = random_buffer(&mut rng, BATCH * FEATURES);
        let mut labels = vec![0.0f32; BATCH * CLASSES];
        for row in 0..BATCH {
            labels[row * CLASSES + rng.random_range(0..CLASSES)] = 1.0;
        }

        let params: Vec<Box<[f32]>> = trainer
            .param_sizes()
            .iter()
            .map(|&n| random_buffer(&mut rng, n))
            .collect();
        let mut gradients: Vec<Box<[f32]>> = trainer
            .param_sizes()
            .iter()
            .map(|&n| vec![0.0f32; n].into_boxed_slice())
            .collect();

        let base_loss = trainer
            .compute_gradients(&features, &labels, &params, &mut gradients)
            .unwrap();
        let analytic: Vec<Box<[f32]>> = gradients.clone();

        for (tensor, grad) in analytic.iter().enumerate() {
            let samples: Vec<usize> = if grad.len() <= 30 {
                (0..grad.len()).collect()
            } else {
                (0..30).map(|_| rng.random_range(0..grad.len())).collect()
            };

            for index in samples {
                let mut perturbed = params.clone();
                perturbed[tensor][index] += DELTA;

                let bumped_loss = trainer
                    .compute_gradients(&features, &labels, &perturbed, &mut gradients)
                    .unwrap();

                let finite = (bumped_loss - base_loss) / DELTA;
                let tolerance = 1e-2 * grad[index].abs().max(1.0);
                assert!(
                    (finite - grad[index]).abs() < tolerance,
                    "tensor {tensor} element {index}: finite {finite} vs analytic {}",
                    grad[index]
                );
            }
        }
    }

    #[test]
    fn test_trainer_loss_is_cross_entropy_at_zero() {
        let loader = DenseHeadLoader::new(FEATURES, CLASSES, BATCH);
        let trainer = HeadTrainer::new(loader.load_trainer().unwrap()).unwrap();

        let features = vec![0.5f32; BATCH * FEATURES];
        let mut labels = vec![0.0f32; BATCH * CLASSES];
        for row in 0..BATCH {
            labels[row * CLASSES] = 1.0;
        }

        let params: Vec<Box<[f32]>> = trainer
            .param_sizes()
            .iter()
            .map(|&n| vec![0.0f32; n].into_boxed_slice())
            .collect();
        let mut gradients: Vec<Box<[f32]>> = params.clone();

        let loss = trainer
            .compute_gradients(&features, &labels, &params, &mut gradients)
            .unwrap();

        // Uniform posterior: loss is ln(classes) regardless of the features.
        assert!((loss - (CLASSES as f32).ln()).abs() < 1e-5);
    }
}
