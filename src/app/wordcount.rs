use anyhow::Result;
use clap::Parser;
use mrflow::workload::wc::WordCount;
use mrflow::{simulate, utils, Engine, JobShape, Registry};
use tracing::info;

/// Count words in a text file across a group of simulated ranks.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Input text file, one record per line
    input: String,

    /// Number of ranks to simulate
    #[arg(short, long, default_value_t = 4)]
    ranks: usize,

    /// Skip the local combine step before the shuffle
    #[arg(long)]
    no_combine: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let counts = simulate(args.ranks, |world| {
        let mut registry = Registry::new();
        let map = registry.register_mapper::<WordCount>();
        let reduce = registry.register_reducer::<WordCount>();
        let combine = registry.register_combiner::<WordCount>();

        let Some(mut engine) = Engine::initialize(world, registry)? else {
            return Ok(None);
        };
        info!(ranks = engine.rank_count(), "group up");

        let mut shape = JobShape::new(map, reduce);
        if !args.no_combine {
            shape = shape.with_combine(combine);
        }

        let input = utils::read_lines(&args.input)?;
        let counts = engine.submit(&shape, &input)?;
        engine.shutdown(0)?;
        Ok(Some(counts))
    })?;

    let mut counts = counts.into_iter().flatten().next().unwrap_or_default();
    counts.sort();
    for (word, count) in counts {
        println!("{word} {count}");
    }
    Ok(())
}
