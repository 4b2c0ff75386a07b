use anyhow::{ensure, Context, Result};
use clap::Parser;
use mrflow::workload::kmeans::{CentroidMean, NearestCentroid, Point};
use mrflow::{simulate, utils, Engine, JobShape, Registry};

/// Cluster 2D points with k-means across a group of simulated ranks.
///
/// Points are scattered once; every iteration broadcasts the current
/// centroids as map side data and reruns the job over the resident
/// shards.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Input file with one `x y` point per line
    input: String,

    /// Number of clusters
    #[arg(short = 'k', long, default_value_t = 8)]
    clusters: usize,

    /// Number of iterations
    #[arg(short, long, default_value_t = 5)]
    iterations: usize,

    /// Number of ranks to simulate
    #[arg(short, long, default_value_t = 4)]
    ranks: usize,
}

fn parse_points(path: &str) -> Result<Vec<Point>> {
    let mut points = Vec::new();
    for line in utils::read_lines(path)? {
        let mut fields = line.split_whitespace();
        let (Some(x), Some(y)) = (fields.next(), fields.next()) else {
            continue;
        };
        points.push((
            x.parse().with_context(|| format!("bad x coordinate in {line:?}"))?,
            y.parse().with_context(|| format!("bad y coordinate in {line:?}"))?,
        ));
    }
    Ok(points)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    simulate(args.ranks, |world| {
        let mut registry = Registry::new();
        let map = registry.register_mapper::<NearestCentroid>();
        let reduce = registry.register_reducer::<CentroidMean>();

        let Some(mut engine) = Engine::initialize(world, registry)? else {
            return Ok(());
        };

        let points = parse_points(&args.input)?;
        ensure!(
            points.len() >= args.clusters,
            "need at least {} points, got {}",
            args.clusters,
            points.len()
        );

        // seed centroids from the first k points, as simple as it gets
        let mut centroids: Vec<Point> = points[..args.clusters].to_vec();
        let shape = JobShape::new(map, reduce);

        engine.scatter_input(&points)?;
        for iteration in 0..args.iterations {
            engine.set_map_side_data(&centroids)?;
            centroids = engine.run_without_scatter(&shape)?;
            centroids.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)));

            println!("iteration {iteration}:");
            for (x, y) in &centroids {
                println!("{x:.3} {y:.3}");
            }
            println!("--------------");
        }

        engine.shutdown(0)?;
        Ok(())
    })?;

    Ok(())
}
