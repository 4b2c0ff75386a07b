//! One k-means iteration as a MapReduce job.
//!
//! The current centroids travel as map side data. Map assigns each point
//! to its nearest centroid by Euclidean distance (ties go to the lowest
//! centroid index); reduce averages the points assigned to a centroid
//! into its new position. The driver loops: broadcast centroids, rerun
//! over the resident points, repeat.

use crate::{Mapper, Reducer};

pub type Point = (f64, f64);

fn distance(a: Point, b: Point) -> f64 {
    let dx = a.0 - b.0;
    let dy = a.1 - b.1;
    (dx * dx + dy * dy).sqrt()
}

/// Assigns points to their nearest centroid.
#[derive(Default)]
pub struct NearestCentroid {
    centroids: Vec<Point>,
}

impl Mapper for NearestCentroid {
    type Input = Point;
    type Key = u32;
    type Value = Point;
    type SideData = Vec<Point>;

    fn setup(&mut self, centroids: Vec<Point>) {
        self.centroids = centroids;
    }

    fn map(&mut self, point: Point, out: &mut Vec<(u32, Point)>) {
        let mut best = 0u32;
        let mut best_dist = f64::INFINITY;
        for (k, centroid) in self.centroids.iter().enumerate() {
            let dist = distance(*centroid, point);
            // strict comparison keeps the lowest index on ties
            if dist < best_dist {
                best = k as u32;
                best_dist = dist;
            }
        }
        out.push((best, point));
    }
}

/// Averages the points assigned to one centroid into its new position.
#[derive(Default)]
pub struct CentroidMean;

impl Reducer for CentroidMean {
    type Key = u32;
    type Value = Point;
    type Output = Point;
    type SideData = ();

    fn reduce(&mut self, _key: u32, points: Vec<Point>) -> Point {
        let count = points.len() as f64;
        let (sx, sy) = points
            .into_iter()
            .fold((0.0, 0.0), |(sx, sy), (x, y)| (sx + x, sy + y));
        (sx / count, sy / count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_centroid_breaks_ties_toward_lowest_index() {
        let mut mapper = NearestCentroid::default();
        mapper.setup(vec![(0.0, 0.0), (2.0, 0.0)]);
        let mut out = Vec::new();
        // equidistant from both centroids
        mapper.map((1.0, 0.0), &mut out);
        assert_eq!(out, vec![(0, (1.0, 0.0))]);
    }

    #[test]
    fn mean_of_assigned_points() {
        let out = CentroidMean.reduce(0, vec![(0.0, 0.0), (2.0, 4.0)]);
        assert_eq!(out, (1.0, 2.0));
    }
}
