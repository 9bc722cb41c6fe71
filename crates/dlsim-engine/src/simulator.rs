// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! The user-facing simulator
//!
//! A [`Simulator`] compiles a model once (plan, signal layout, executor) and
//! then advances it in unrolled blocks of steps, recording probes and
//! optionally writing execution summaries and profiles.

use std::path::{Path, PathBuf};
use std::time::Instant;

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, warn};

use dlsim_config::{
    ConfigError, DeviceSpec, DlsimConfig, PlannerKind, Precision, TrainingConfig,
};
use dlsim_model::{build, Model, Network, SignalId};
use dlsim_observability::with_chrome_trace;

use crate::backend::{select_backend, BackendDecision};
use crate::error::{Result, SimError};
use crate::executor::{Executor, SignalState};
use crate::feeds::{check_input_feeds, generate_inputs, InputFeeds};
use crate::float::SimFloat;
use crate::optimizer::{optimizer_from_config, Optimizer};
use crate::params::{format_params, ParamFile};
use crate::planner::{plan_operators, Plan};
use crate::probes::{ProbeData, ProbeRecorder};
use crate::progress::ProgressBar;
use crate::signal_order::{noop_order_signals, order_signals};
use crate::summary::{GraphSummary, RunEvent, SummaryWriter};
use crate::tensor_signal::create_signals;
use crate::training::{Objective, TargetData, Trainer};

/// File name of the Chrome trace written by profiled runs
pub const PROFILE_FILE: &str = "dlsim_profile.json";

#[derive(Debug, Clone)]
pub struct SimulatorOptions {
    pub dt: f64,
    /// `None` draws a seed from the network or at random
    pub seed: Option<u64>,
    pub dtype: Precision,
    pub device: DeviceSpec,
    pub unroll_simulation: usize,
    /// `None` disables minibatching; probe data then has no batch axis
    pub minibatch_size: Option<usize>,
    pub tensorboard: bool,
    /// Profile every run, not only those requesting it
    pub profile: bool,
    pub progress_bar: bool,
    pub planner: PlannerKind,
    pub sort_signals: bool,
    pub n_passes: usize,
    pub data_dir: PathBuf,
    pub fd_epsilon: f64,
}

impl Default for SimulatorOptions {
    fn default() -> Self {
        Self::from_config(&DlsimConfig::default())
    }
}

impl SimulatorOptions {
    pub fn from_config(config: &DlsimConfig) -> Self {
        let sim = &config.simulator;
        Self {
            dt: sim.dt,
            seed: sim.seed,
            dtype: sim.dtype,
            device: sim.device,
            unroll_simulation: sim.unroll_simulation,
            minibatch_size: sim.minibatch_size,
            tensorboard: sim.tensorboard,
            profile: sim.profile,
            progress_bar: sim.progress_bar,
            planner: config.graph_optimizer.planner,
            sort_signals: config.graph_optimizer.sort_signals,
            n_passes: config.graph_optimizer.n_passes,
            data_dir: config.system.data_dir.clone(),
            fd_epsilon: config.training.fd_epsilon,
        }
    }

    pub fn with_dt(mut self, dt: f64) -> Self {
        self.dt = dt;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_dtype(mut self, dtype: Precision) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn with_device(mut self, device: DeviceSpec) -> Self {
        self.device = device;
        self
    }

    pub fn with_unroll(mut self, unroll_simulation: usize) -> Self {
        self.unroll_simulation = unroll_simulation;
        self
    }

    pub fn with_minibatch_size(mut self, minibatch_size: usize) -> Self {
        self.minibatch_size = Some(minibatch_size);
        self
    }

    pub fn with_tensorboard(mut self, enabled: bool) -> Self {
        self.tensorboard = enabled;
        self
    }

    pub fn with_planner(mut self, planner: PlannerKind) -> Self {
        self.planner = planner;
        self
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    pub fn with_progress_bar(mut self, enabled: bool) -> Self {
        self.progress_bar = enabled;
        self
    }

    /// Batch width of every minibatched base array
    pub fn minibatch(&self) -> usize {
        self.minibatch_size.unwrap_or(1)
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if !(self.dt > 0.0 && self.dt.is_finite()) {
            errors.push(format!("dt must be positive, got {}", self.dt));
        }
        if self.unroll_simulation == 0 {
            errors.push("unroll_simulation must be at least 1".to_string());
        }
        if self.minibatch_size == Some(0) {
            errors.push("minibatch_size must be at least 1".to_string());
        }
        if self.n_passes == 0 {
            errors.push("n_passes must be at least 1".to_string());
        }
        if !(self.fd_epsilon > 0.0) {
            errors.push(format!("fd_epsilon must be positive, got {}", self.fd_epsilon));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(SimError::Config(ConfigError::ValidationError(errors.join("; "))))
        }
    }
}

/// Per-run overrides
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub input_feeds: InputFeeds,
    pub profile: bool,
}

impl RunOptions {
    pub fn with_feeds(mut self, input_feeds: InputFeeds) -> Self {
        self.input_feeds = input_feeds;
        self
    }

    pub fn with_profile(mut self, profile: bool) -> Self {
        self.profile = profile;
        self
    }
}

struct Compiled<T: SimFloat> {
    executor: Executor<T>,
    recorder: ProbeRecorder,
    summary: Option<SummaryWriter>,
}

fn compile<T: SimFloat>(model: &Model, options: &SimulatorOptions) -> Result<Compiled<T>> {
    let started = Instant::now();
    let (graph, plan) = plan_operators(model, options.planner)?;
    let (order, plan): (_, Plan) = if options.sort_signals {
        order_signals(model, &plan, options.n_passes)
    } else {
        noop_order_signals(model, &plan)
    };
    let layout = create_signals::<T>(model, &order, &plan, options.minibatch())?;
    info!(
        "[SIM] Compiled '{}' ({}): {} operators, {} dependencies, {} groups, {} base arrays in {:.3}s",
        model.label,
        T::NAME,
        model.operators.len(),
        graph.n_edges(),
        plan.len(),
        layout.bases.len(),
        started.elapsed().as_secs_f64()
    );

    let summary = if options.tensorboard {
        let writer = SummaryWriter::create(&options.data_dir, &model.label)?;
        writer.write_graph(&GraphSummary::new(model, &plan, &layout, &options.planner.to_string()))?;
        Some(writer)
    } else {
        None
    };

    let executor = Executor::new(model, &plan, layout, options.unroll_simulation)?;
    let recorder = ProbeRecorder::new(model, &executor, options.minibatch_size.is_some())?;
    Ok(Compiled {
        executor,
        recorder,
        summary,
    })
}

pub struct Simulator<T: SimFloat> {
    model: Model,
    options: SimulatorOptions,
    backend: BackendDecision,
    executor: Executor<T>,
    state: SignalState<T>,
    recorder: ProbeRecorder,
    summary: Option<SummaryWriter>,
    rng: StdRng,
    seed: u64,
    n_steps: usize,
    closed: bool,
}

impl<T: SimFloat> Simulator<T> {
    /// Build `network` and compile it
    pub fn new(network: &Network, options: SimulatorOptions) -> Result<Self> {
        options.validate()?;
        let seed = options.seed.or(network.seed).unwrap_or_else(rand::random);
        let model = build(network, options.dt, seed)?;
        Self::assemble(model, options, seed)
    }

    /// Compile an already built model; the model's `dt` wins over the options
    pub fn from_model(model: Model, options: SimulatorOptions) -> Result<Self> {
        options.validate()?;
        if (model.dt - options.dt).abs() > f64::EPSILON {
            warn!("Model dt ({}) does not match Simulator dt ({})", model.dt, options.dt);
        }
        let seed = options.seed.unwrap_or_else(rand::random);
        Self::assemble(model, options, seed)
    }

    fn assemble(model: Model, options: SimulatorOptions, seed: u64) -> Result<Self> {
        model.validate()?;
        let backend = select_backend(&options.device);
        let compiled = compile::<T>(&model, &options)?;
        let state = compiled.executor.initial_state();
        Ok(Self {
            model,
            options,
            backend,
            executor: compiled.executor,
            state,
            recorder: compiled.recorder,
            summary: compiled.summary,
            rng: StdRng::seed_from_u64(seed),
            seed,
            n_steps: 0,
            closed: false,
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(SimError::Closed)
        } else {
            Ok(())
        }
    }

    /// Recompile and return to time zero, optionally with a new seed
    ///
    /// A closed simulator cannot be reset.
    pub fn reset(&mut self, seed: Option<u64>) -> Result<()> {
        self.ensure_open()?;
        let compiled = compile::<T>(&self.model, &self.options)?;
        if let Some(seed) = seed {
            self.seed = seed;
        }
        self.state = compiled.executor.initial_state();
        self.executor = compiled.executor;
        self.recorder = compiled.recorder;
        self.summary = compiled.summary;
        self.rng = StdRng::seed_from_u64(self.seed);
        self.n_steps = 0;
        info!("[SIM] Simulator for '{}' reset (seed {})", self.model.label, self.seed);
        Ok(())
    }

    /// Restore initial values without recompiling
    ///
    /// Trainable values are kept unless `include_trainable`; probe data and
    /// the step count are cleared only with `include_probes`.
    pub fn soft_reset(&mut self, include_trainable: bool, include_probes: bool) -> Result<()> {
        self.ensure_open()?;
        let layout = self.executor.layout();
        for (key, params) in layout.params.iter().enumerate() {
            if include_trainable || !params.trainable {
                self.state[key] = layout.bases[key].clone();
            }
        }
        if include_probes {
            self.recorder.clear();
            self.n_steps = 0;
        }
        Ok(())
    }

    pub fn step(&mut self) -> Result<()> {
        self.run_steps(1)
    }

    /// Run for `seconds` of simulated time, rounded to whole steps
    pub fn run(&mut self, seconds: f64) -> Result<()> {
        if !(seconds >= 0.0 && seconds.is_finite()) {
            return Err(SimError::Simulation(format!("cannot run for {} seconds", seconds)));
        }
        let steps = (seconds / self.dt()).round();
        if steps >= usize::MAX as f64 {
            return Err(SimError::Simulation(format!(
                "cannot run for {} seconds ({} steps of {})",
                seconds,
                steps,
                self.dt()
            )));
        }
        self.run_steps(steps as usize)
    }

    pub fn run_steps(&mut self, n_steps: usize) -> Result<()> {
        self.run_steps_with(n_steps, &RunOptions::default())
    }

    /// Run `n_steps` steps with feeds and profiling
    ///
    /// Steps are executed in blocks of `unroll_simulation`; when `n_steps` is
    /// not a multiple, the extra steps still execute and change the internal
    /// state but are not recorded or counted.
    pub fn run_steps_with(&mut self, n_steps: usize, run_options: &RunOptions) -> Result<()> {
        self.ensure_open()?;
        let unroll = self.executor.unroll();
        let actual = n_steps
            .div_ceil(unroll)
            .checked_mul(unroll)
            .ok_or_else(|| {
                SimError::Simulation(format!(
                    "{} steps rounded up to a multiple of unroll_simulation ({}) overflows",
                    n_steps, unroll
                ))
            })?;
        if actual != n_steps {
            warn!(
                "Number of steps ({}) is not an even multiple of `unroll_simulation` ({}). \
                 Simulation will run for {} steps, which may have unintended side effects.",
                n_steps, unroll, actual
            );
        }

        let minibatch = self.options.minibatch();
        check_input_feeds(&self.model, &run_options.input_feeds, n_steps, minibatch)?;
        let start = self.n_steps;
        let inputs = generate_inputs::<T>(
            &self.model,
            &run_options.input_feeds,
            start,
            actual,
            minibatch,
            self.model.dt,
        )?;

        let Self {
            model,
            options,
            executor,
            state,
            recorder,
            ..
        } = &mut *self;
        executor.set_step(state, start)?;
        let mut progress = ProgressBar::new(format!("Simulating '{}'", model.label), actual, options.progress_bar);
        let mut body = || {
            executor.run(state, &inputs, actual / unroll, |index, st| {
                if index < n_steps {
                    recorder.record(start + index, executor.probe_values(st));
                }
                progress.tick(1);
                Ok(())
            })
        };

        if run_options.profile || options.profile {
            let path = options.data_dir.join(PROFILE_FILE);
            with_chrome_trace(&path, body)??;
            info!("[SIM] Profile written to {}", path.display());
        } else {
            body()?;
        }
        let elapsed = progress.finish();

        self.n_steps += n_steps;
        if let Some(summary) = &self.summary {
            summary.log_event(&RunEvent::new("run", start, n_steps, elapsed))?;
        }
        Ok(())
    }

    /// Everything recorded since the last reset
    pub fn data(&self) -> ProbeData {
        self.recorder.data()
    }

    /// Current value of any mapped signal as `(size, batch)`
    pub fn signal_value(&self, signal: SignalId) -> Result<Array2<f64>> {
        let ts = self.executor.layout().require(signal)?;
        Ok(ts.gather(&self.state).mapv(|v| v.into_f64()))
    }

    pub fn n_steps(&self) -> usize {
        self.n_steps
    }

    pub fn time(&self) -> f64 {
        self.n_steps as f64 * self.dt()
    }

    pub fn dt(&self) -> f64 {
        self.model.dt
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn options(&self) -> &SimulatorOptions {
        &self.options
    }

    pub fn backend(&self) -> &BackendDecision {
        &self.backend
    }

    pub fn executor(&self) -> &Executor<T> {
        &self.executor
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn summary_dir(&self) -> Option<&Path> {
        self.summary.as_ref().map(|s| s.run_dir())
    }

    /// Times `dt, 2 dt, ...` of every `dt` period simulated so far
    pub fn trange(&self, dt: Option<f64>) -> Vec<f64> {
        let dt = dt.unwrap_or_else(|| self.dt());
        let n = (self.n_steps as f64 * self.dt() / dt + 1e-9).floor() as usize;
        (1..=n).map(|i| i as f64 * dt).collect()
    }

    fn trainer(&self) -> Trainer<'_, T> {
        Trainer {
            model: &self.model,
            executor: &self.executor,
            minibatch_size: self.options.minibatch(),
            fd_epsilon: self.options.fd_epsilon,
        }
    }

    /// Optimise trainable values; returns the mean loss of each epoch
    ///
    /// Inputs and targets are `(batch, n_steps, size)`; simulation time and
    /// probe data are not affected.
    pub fn train(
        &mut self,
        inputs: &InputFeeds,
        targets: &TargetData,
        optimizer: &mut dyn Optimizer,
        n_epochs: usize,
        objective: &Objective,
        shuffle: bool,
    ) -> Result<Vec<f64>> {
        self.ensure_open()?;
        let started = Instant::now();
        let trainer = Trainer {
            model: &self.model,
            executor: &self.executor,
            minibatch_size: self.options.minibatch(),
            fd_epsilon: self.options.fd_epsilon,
        };
        let losses = trainer.train(
            &mut self.state,
            inputs,
            targets,
            optimizer,
            n_epochs,
            objective,
            shuffle,
            &mut self.rng,
        )?;
        let elapsed = started.elapsed().as_secs_f64();
        info!(
            "[TRAIN] Finished {} epochs in {:.3}s, final loss {:?}",
            n_epochs,
            elapsed,
            losses.last()
        );
        if let Some(summary) = &self.summary {
            let steps = targets.values().next().map_or(0, |t| t.dim().1);
            let mut event = RunEvent::new("train", 0, steps, elapsed);
            if let Some(loss) = losses.last() {
                event = event.with_loss(*loss);
            }
            summary.log_event(&event)?;
        }
        Ok(losses)
    }

    /// [`Simulator::train`] with the optimizer and epochs from `[training]`
    pub fn train_with_config(
        &mut self,
        inputs: &InputFeeds,
        targets: &TargetData,
        config: &TrainingConfig,
        objective: &Objective,
    ) -> Result<Vec<f64>> {
        let mut optimizer = optimizer_from_config(config.optimizer, config.learning_rate);
        self.train(inputs, targets, optimizer.as_mut(), config.n_epochs, objective, config.shuffle)
    }

    pub fn loss(&self, inputs: &InputFeeds, targets: &TargetData, objective: &Objective) -> Result<f64> {
        self.ensure_open()?;
        self.trainer().loss(&self.state, inputs, targets, objective)
    }

    pub fn save_params(&self, path: &Path, include_local: bool) -> Result<()> {
        self.ensure_open()?;
        ParamFile::collect(self.executor.layout(), &self.state, include_local).save(path)
    }

    pub fn load_params(&mut self, path: &Path, include_local: bool) -> Result<()> {
        self.ensure_open()?;
        ParamFile::load(path)?.apply(self.executor.layout(), &mut self.state, include_local)
    }

    pub fn format_params(&self, msg: Option<&str>) -> Result<String> {
        self.ensure_open()?;
        Ok(format_params(self.executor.layout(), &self.state, msg))
    }

    pub fn print_params(&self, msg: Option<&str>) -> Result<()> {
        print!("{}", self.format_params(msg)?);
        Ok(())
    }

    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            info!("[SIM] Simulator for '{}' closed", self.model.label);
        }
    }
}

impl<T: SimFloat> Drop for Simulator<T> {
    fn drop(&mut self) {
        if !self.closed {
            warn!(
                "Simulator with model '{}' was deallocated while open. Simulators should be closed manually with close()",
                self.model.label
            );
            self.close();
        }
    }
}
