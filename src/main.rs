use alacarte::optimize::{
    AdaDelta, AdaGrad, Momentum, RateRule, SgdConfig, StartConfig, StartStrategy,
};
use alacarte::regression::data::{load_prediction_tsv, load_training_tsv};
use alacarte::regression::{
    BasisKind, Dataset, LinearBasis, RandomRbf, RandomRbfArd, RegressConfig, TrainedModel,
    TrainingSettings, msll_against, smse,
};

use clap::{Args, Parser, Subcommand, ValueEnum};
use ndarray::Array1;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process;

#[derive(Parser)]
#[command(
    name = "alacarte",
    version,
    about = "Bayesian linear regression over random basis functions",
    long_about = "Trains Bayesian linear regression models on random Fourier (or linear) features \
                  by maximizing the evidence lower bound, then predicts with calibrated variances."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model from a TSV file with a 'target' column
    #[command(about = "Train a model (outputs: model.toml)")]
    Train {
        training_data: PathBuf,

        #[command(flatten)]
        settings: TrainArgs,

        /// Where to write the trained model
        #[arg(long, default_value = "model.toml")]
        output: PathBuf,
    },

    /// Apply a trained model to new data
    #[command(about = "Predict with a trained model (outputs: predictions.tsv)")]
    Infer {
        test_data: PathBuf,

        /// Path to a trained model file (.toml)
        #[arg(long)]
        model: PathBuf,

        #[arg(long, default_value = "predictions.tsv")]
        output: PathBuf,
    },

    /// Train on one file and report SMSE and MSLL on another
    Demo {
        training_data: PathBuf,
        test_data: PathBuf,

        #[command(flatten)]
        settings: TrainArgs,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Solver {
    /// Optimal posterior in closed form, hyperparameters by multi-start BFGS
    ClosedForm,
    /// Minibatch stochastic gradient ascent with a diagonal posterior
    Sgd,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BasisChoice {
    Linear,
    Rbf,
    Ard,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RateChoice {
    Adadelta,
    Adagrad,
    Momentum,
}

#[derive(Args, Debug)]
struct TrainArgs {
    #[arg(long, value_enum, default_value = "closed-form")]
    solver: Solver,

    #[arg(long, value_enum, default_value = "rbf")]
    basis: BasisChoice,

    /// Number of random frequencies (the feature count is twice this)
    #[arg(long, default_value = "100")]
    nbases: usize,

    /// Initial length scale of the random bases
    #[arg(long, default_value = "1.0")]
    lenscale: f64,

    /// Initial noise variance
    #[arg(long, default_value = "1.0")]
    noise: f64,

    /// Initial prior weight variance
    #[arg(long, default_value = "1.0")]
    regulariser: f64,

    /// Keep only the diagonal of the posterior covariance
    #[arg(long)]
    diagcov: bool,

    /// Number of candidate starts screened before the local searches
    #[arg(long, default_value = "32")]
    starts: usize,

    #[arg(long, default_value = "10")]
    passes: usize,

    #[arg(long, value_enum, default_value = "adadelta")]
    rate: RateChoice,

    /// Relative change of the smoothed objective that ends SGD early
    #[arg(long, default_value = "1e-5")]
    eta: f64,

    #[arg(long, default_value = "10")]
    batch_size: usize,

    #[arg(long, default_value = "42")]
    seed: u64,

    /// Wall-clock budget in seconds for the optimizer
    #[arg(long)]
    walltime: Option<f64>,
}

impl TrainArgs {
    fn training_settings(&self) -> TrainingSettings {
        match self.solver {
            Solver::ClosedForm => TrainingSettings::ClosedForm(RegressConfig {
                diagcov: self.diagcov,
                start: StartConfig {
                    strategy: StartStrategy::Random {
                        candidates: self.starts,
                    },
                    walltime_secs: self.walltime,
                    ..StartConfig::default()
                },
            }),
            Solver::Sgd => TrainingSettings::Stochastic(SgdConfig {
                rule: match self.rate {
                    RateChoice::Adadelta => RateRule::AdaDelta(AdaDelta::default()),
                    RateChoice::Adagrad => RateRule::AdaGrad(AdaGrad::default()),
                    RateChoice::Momentum => RateRule::Momentum(Momentum::default()),
                },
                batch_size: self.batch_size,
                passes: self.passes,
                eta: self.eta,
                walltime_secs: self.walltime,
                ..SgdConfig::default()
            }),
        }
    }

    fn basis(&self, input_dim: usize, rng: &mut StdRng) -> Result<BasisKind, Box<dyn Error>> {
        Ok(match self.basis {
            BasisChoice::Linear => BasisKind::Linear(LinearBasis::new(input_dim, true)),
            BasisChoice::Rbf => {
                BasisKind::RandomRbf(RandomRbf::new(self.nbases, input_dim, self.lenscale, rng)?)
            }
            BasisChoice::Ard => BasisKind::RandomRbfArd(RandomRbfArd::new(
                self.nbases,
                Array1::from_elem(input_dim, self.lenscale),
                rng,
            )?),
        })
    }

    fn train(&self, data: &Dataset) -> Result<TrainedModel, Box<dyn Error>> {
        let target = data
            .target
            .as_ref()
            .ok_or("the training data has no 'target' column")?;
        let mut rng = StdRng::seed_from_u64(self.seed);
        let basis = self.basis(data.features.ncols(), &mut rng)?;
        let model = TrainedModel::fit(
            data.features.view(),
            target.view(),
            data.feature_names.clone(),
            basis,
            self.training_settings(),
            self.noise,
            self.regulariser,
            self.seed,
            &mut rng,
        )?;
        if !model.posterior.converged {
            log::warn!("Training stopped before convergence; the model is a best-effort result");
        }
        log::info!(
            "Noise variance {:.4e}, regulariser {:.4e}",
            model.posterior.noise_variance,
            model.posterior.regulariser
        );
        Ok(model)
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Train {
            training_data,
            settings,
            output,
        } => train_command(&training_data, &settings, &output),
        Commands::Infer {
            test_data,
            model,
            output,
        } => infer_command(&test_data, &model, &output),
        Commands::Demo {
            training_data,
            test_data,
            settings,
        } => demo_command(&training_data, &test_data, &settings),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn train_command(path: &Path, settings: &TrainArgs, output: &Path) -> Result<(), Box<dyn Error>> {
    let data = load_training_tsv(path)?;
    let model = settings.train(&data)?;
    model.save(output)?;
    println!("Model saved to: {}", output.display());
    Ok(())
}

/// Logs SMSE and MSLL when the scored data carries targets.
fn report_scores(
    model: &TrainedModel,
    data: &Dataset,
    mean: &Array1<f64>,
    variance: &Array1<f64>,
) -> Result<(), Box<dyn Error>> {
    if let Some(target) = &data.target {
        let smse_score = smse(target.view(), mean.view())?;
        let msll_score = msll_against(
            target.view(),
            mean.view(),
            variance.view(),
            model.target_mean,
            model.target_variance,
        )?;
        log::info!("SMSE = {smse_score:.5}, MSLL = {msll_score:.5}");
        println!("SMSE\t{smse_score:.6}\nMSLL\t{msll_score:.6}");
    }
    Ok(())
}

fn infer_command(path: &Path, model_path: &Path, output: &Path) -> Result<(), Box<dyn Error>> {
    let model = TrainedModel::load(model_path)?;
    let data = load_prediction_tsv(path, model.feature_names.len())?;
    if data.feature_names != model.feature_names {
        log::warn!(
            "Feature columns {:?} differ from the trained columns {:?}; matching by position",
            data.feature_names,
            model.feature_names
        );
    }
    let prediction = model.predict(data.features.view())?;

    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(output)?;
    writer.write_record(["sample_id", "mean", "latent_variance", "variance"])?;
    for (i, id) in data.sample_ids.iter().enumerate() {
        writer.write_record([
            id.clone(),
            prediction.mean[i].to_string(),
            prediction.latent_variance[i].to_string(),
            prediction.variance[i].to_string(),
        ])?;
    }
    writer.flush()?;
    println!("Predictions saved to: {}", output.display());

    report_scores(&model, &data, &prediction.mean, &prediction.variance)
}

fn demo_command(train_path: &Path, test_path: &Path, settings: &TrainArgs) -> Result<(), Box<dyn Error>> {
    let train = load_training_tsv(train_path)?;
    let test = load_prediction_tsv(test_path, train.feature_names.len())?;
    if test.target.is_none() {
        return Err("the test data needs a 'target' column to be scored".into());
    }
    let model = settings.train(&train)?;
    let prediction = model.predict(test.features.view())?;
    report_scores(&model, &test, &prediction.mean, &prediction.variance)
}
