use anyhow::{Context, Result};
use clap::Parser;
use itertools::Itertools;
use tracing::{info, metadata::LevelFilter, warn};

use plane::ml::{
    data::{
        prepare_data, IteratorSettings, MultiSourceTextIterator, TempFileShuffler, TextIterator,
    },
    dropout::{DropoutMaskProvider, DropoutMode},
    model::{DualSourceSeq2Seq, Seq2Seq},
    options::ModelOptions,
    NodeValue, RngStrategy,
};

use config::{BatchesConfig, Command, CorpusConfig, InitConfig, ScoreConfig};

mod config;

fn main() -> Result<()> {
    let cli = config::Cli::parse();
    configure_logging(cli.log_level);

    match cli.command {
        Command::Batches(config) => report_batches(config),
        Command::Score(config) => score_corpus(config),
        Command::Init(config) => init_params(config),
    }
}

fn configure_logging(level: LevelFilter) {
    let subscriber = tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_max_level(level)
        .finish();

    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install log subscriber: {err}");
    }
}

fn load_options(path: Option<&str>) -> Result<ModelOptions> {
    match path {
        Some(path) => ModelOptions::load_json(path),
        None => {
            let options = ModelOptions::default();
            options.validate()?;
            Ok(options)
        }
    }
}

fn iterator_settings(options: &ModelOptions, corpus: &CorpusConfig) -> IteratorSettings {
    let mut settings = IteratorSettings::from_options(options);
    settings.shuffle_each_epoch = corpus.shuffle;
    if let Some(batch_size) = corpus.batch_size {
        settings.batch_size = batch_size;
    }
    if let Some(maxlen) = corpus.maxlen {
        settings.maxlen = maxlen;
    }
    settings
}

fn open_iterator(corpus: &CorpusConfig, settings: IteratorSettings) -> Result<TextIterator> {
    let builder = TextIterator::new_builder(&corpus.source, &corpus.target)
        .with_source_dicts(&corpus.source_dicts)
        .with_target_dict(&corpus.target_dict)
        .with_settings(settings.clone());
    let builder = if settings.shuffle_each_epoch {
        builder.with_shuffler(Box::new(TempFileShuffler::default()))
    } else {
        builder
    };
    builder.build().context("failed to open corpus")
}

fn report_batches(config: BatchesConfig) -> Result<()> {
    let options = load_options(config.corpus.config.as_deref())?;
    let settings = iterator_settings(&options, &config.corpus);
    info!(?settings, "streaming one epoch");

    let lengths: Vec<(usize, usize, usize)> = match &config.source2 {
        Some(source2) => {
            let corpus = &config.corpus;
            let builder =
                MultiSourceTextIterator::new_builder(&corpus.source, source2, &corpus.target)
                    .with_source_dicts(&corpus.source_dicts)
                    .with_target_dict(&corpus.target_dict)
                    .with_alignments(config.align1.as_ref(), config.align2.as_ref())
                    .with_settings(settings.clone());
            let builder = if settings.shuffle_each_epoch {
                builder.with_shuffler(Box::new(TempFileShuffler::default()))
            } else {
                builder
            };
            builder
                .build()
                .context("failed to open corpus")?
                .map(|batch| {
                    let tokens = batch.source1.iter().chain(&batch.source2).map(|x| x.len());
                    (
                        batch.len(),
                        tokens.sum::<usize>(),
                        batch.target.iter().map(|x| x.len()).sum::<usize>(),
                    )
                })
                .collect()
        }
        None => open_iterator(&config.corpus, settings)?
            .map(|batch| {
                let source_tokens = batch.source.iter().map(|x| x.len()).sum::<usize>();
                let target_tokens = batch.target.iter().map(|x| x.len()).sum::<usize>();
                (batch.len(), source_tokens, target_tokens)
            })
            .collect(),
    };

    for (idx, (sentences, source_tokens, target_tokens)) in lengths.iter().enumerate() {
        println!("batch {idx}: sentences={sentences} source_tokens={source_tokens} target_tokens={target_tokens}");
    }
    let sentences: usize = lengths.iter().map(|x| x.0).sum();
    info!(batches = lengths.len(), sentences, "finished epoch");
    Ok(())
}

fn score_corpus(config: ScoreConfig) -> Result<()> {
    let options = load_options(config.corpus.config.as_deref())?;
    let settings = iterator_settings(&options, &config.corpus);
    let model = Seq2Seq::new(options.clone())?;

    let rng = RngStrategy::Debug { seed: config.seed }.upgrade();
    let mut params = model.init_params(&rng)?;
    if let Some(path) = &config.params {
        params.load_json(path)?;
    }

    let mode = if config.training {
        DropoutMode::Training
    } else {
        DropoutMode::Sampling
    };
    let dropout = DropoutMaskProvider::from_options(&options, mode, rng.fork());

    let mut total: NodeValue = 0.0;
    let mut sentences = 0;
    for (idx, batch) in open_iterator(&config.corpus, settings)?.enumerate() {
        let Some(prepared) = prepare_data(&batch.source, &batch.target, options.factors, None)?
        else {
            warn!(idx, "skipping empty batch");
            continue;
        };
        let cost = model.cost(&params, &prepared, &dropout)?;
        println!("{}", cost.iter().map(|x| format!("{x:.6}")).join("\n"));

        let batch_total: NodeValue = cost.iter().sum();
        info!(
            idx,
            mean_cost = batch_total / cost.len() as NodeValue,
            "scored batch"
        );
        total += batch_total;
        sentences += cost.len();
    }

    if sentences > 0 {
        info!(sentences, mean_cost = total / sentences as NodeValue, "scored corpus");
    }
    Ok(())
}

fn init_params(config: InitConfig) -> Result<()> {
    let options = load_options(config.config.as_deref())?;
    let rng = RngStrategy::Debug { seed: config.seed }.upgrade();

    let params = if config.dual {
        DualSourceSeq2Seq::new(options)?.init_params(&rng)?
    } else {
        Seq2Seq::new(options)?.init_params(&rng)?
    };
    params.save_json(&config.output)?;
    info!(path = %config.output, tensors = params.len(), "wrote parameters");
    Ok(())
}
