//! Axis-aligned latitude/longitude rectangles.

use std::ops::RangeInclusive;

use geo::{Coord, Intersects, Rect};
use serde::{Deserialize, Serialize};

use crate::tag_index::bucket_from_lat_or_lon;

/// A lat/lon bounding box in WGS84 degrees. Edges are inclusive.
///
/// Regions crossing the antimeridian are not modelled; callers split them
/// into two boxes.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Bounds {
    /// Southern edge.
    pub min_lat: f64,
    /// Northern edge.
    pub max_lat: f64,
    /// Western edge.
    pub min_lon: f64,
    /// Eastern edge.
    pub max_lon: f64,
}

impl Bounds {
    /// Build a box, swapping edges given in the wrong order.
    #[must_use]
    pub fn new(min_lat: f64, max_lat: f64, min_lon: f64, max_lon: f64) -> Self {
        Self {
            min_lat: min_lat.min(max_lat),
            max_lat: max_lat.max(min_lat),
            min_lon: min_lon.min(max_lon),
            max_lon: max_lon.max(min_lon),
        }
    }

    /// Smallest box holding every `(lat, lon)` point, or `None` for no points.
    #[must_use]
    pub fn from_points<I>(points: I) -> Option<Self>
    where
        I: IntoIterator<Item = (f64, f64)>,
    {
        points.into_iter().fold(None, |acc: Option<Self>, (lat, lon)| {
            Some(match acc {
                Some(bounds) => bounds.extended(lat, lon),
                None => Self::new(lat, lat, lon, lon),
            })
        })
    }

    /// This box grown to include `(lat, lon)`.
    #[must_use]
    pub fn extended(self, lat: f64, lon: f64) -> Self {
        Self {
            min_lat: self.min_lat.min(lat),
            max_lat: self.max_lat.max(lat),
            min_lon: self.min_lon.min(lon),
            max_lon: self.max_lon.max(lon),
        }
    }

    /// Whether the point lies inside the box or on its edge.
    #[must_use]
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        Rect::from(*self).intersects(&Coord { x: lon, y: lat })
    }

    /// Whether `item` shares at least one point with this box.
    ///
    /// # Examples
    /// ```
    /// use mapstore_core::Bounds;
    ///
    /// let container = Bounds::new(0.0, 10.0, 0.0, 10.0);
    /// assert!(container.overlaps(&Bounds::new(5.0, 15.0, 5.0, 15.0)));
    /// assert!(!container.overlaps(&Bounds::new(11.0, 12.0, 0.0, 10.0)));
    /// ```
    #[must_use]
    pub fn overlaps(&self, item: &Self) -> bool {
        item.min_lat <= self.max_lat
            && item.max_lat >= self.min_lat
            && item.min_lon <= self.max_lon
            && item.max_lon >= self.min_lon
    }

    /// Spatial bucket ranges `(latitudes, longitudes)` covering the box.
    #[must_use]
    pub fn bucket_range(&self) -> (RangeInclusive<i32>, RangeInclusive<i32>) {
        (
            bucket_from_lat_or_lon(self.min_lat)..=bucket_from_lat_or_lon(self.max_lat),
            bucket_from_lat_or_lon(self.min_lon)..=bucket_from_lat_or_lon(self.max_lon),
        )
    }
}

impl From<Rect<f64>> for Bounds {
    fn from(rect: Rect<f64>) -> Self {
        Self::new(rect.min().y, rect.max().y, rect.min().x, rect.max().x)
    }
}

impl From<Bounds> for Rect<f64> {
    fn from(bounds: Bounds) -> Self {
        Self::new(
            Coord {
                x: bounds.min_lon,
                y: bounds.min_lat,
            },
            Coord {
                x: bounds.max_lon,
                y: bounds.max_lat,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn container() -> Bounds {
        Bounds::new(10.0, 20.0, 30.0, 40.0)
    }

    #[rstest]
    fn overlaps_itself(container: Bounds) {
        assert!(container.overlaps(&container));
    }

    #[rstest]
    #[case::above(Bounds::new(21.0, 25.0, 32.0, 38.0), false)]
    #[case::below(Bounds::new(5.0, 9.0, 32.0, 38.0), false)]
    #[case::left(Bounds::new(12.0, 18.0, 20.0, 29.0), false)]
    #[case::right(Bounds::new(12.0, 18.0, 41.0, 45.0), false)]
    #[case::partial_top(Bounds::new(18.0, 25.0, 32.0, 38.0), true)]
    #[case::partial_bottom(Bounds::new(5.0, 12.0, 32.0, 38.0), true)]
    #[case::partial_left(Bounds::new(12.0, 18.0, 25.0, 32.0), true)]
    #[case::partial_right(Bounds::new(12.0, 18.0, 38.0, 45.0), true)]
    #[case::partial_top_left(Bounds::new(18.0, 25.0, 25.0, 32.0), true)]
    #[case::partial_top_right(Bounds::new(18.0, 25.0, 38.0, 45.0), true)]
    #[case::partial_bottom_left(Bounds::new(5.0, 12.0, 25.0, 32.0), true)]
    #[case::partial_bottom_right(Bounds::new(5.0, 12.0, 38.0, 45.0), true)]
    #[case::fully_inside(Bounds::new(12.0, 18.0, 32.0, 38.0), true)]
    fn classifies_placements(container: Bounds, #[case] item: Bounds, #[case] expected: bool) {
        assert_eq!(container.overlaps(&item), expected);
    }

    #[rstest]
    fn container_inside_item_overlaps(container: Bounds) {
        let item = Bounds::new(0.0, 50.0, 0.0, 50.0);
        assert!(container.overlaps(&item));
        assert!(item.overlaps(&container));
    }

    #[rstest]
    #[case(10.0, 30.0, true)]
    #[case(20.0, 40.0, true)]
    #[case(15.0, 35.0, true)]
    #[case(20.000_001, 35.0, false)]
    #[case(15.0, 29.999_999, false)]
    fn contains_includes_edges(
        container: Bounds,
        #[case] lat: f64,
        #[case] lon: f64,
        #[case] expected: bool,
    ) {
        assert_eq!(container.contains(lat, lon), expected);
    }

    #[rstest]
    fn new_normalises_swapped_edges() {
        assert_eq!(
            Bounds::new(2.0, 1.0, 4.0, 3.0),
            Bounds::new(1.0, 2.0, 3.0, 4.0)
        );
    }

    #[rstest]
    fn rect_conversion_round_trips(container: Bounds) {
        let rect: Rect<f64> = container.into();
        assert_eq!(Bounds::from(rect), container);
    }

    #[rstest]
    fn bucket_range_spans_edges() {
        let bounds = Bounds::new(0.005, 0.021, -0.015, 0.0);
        let (lats, lons) = bounds.bucket_range();
        assert_eq!(lats, 0..=2);
        assert_eq!(lons, -2..=0);
    }
}
