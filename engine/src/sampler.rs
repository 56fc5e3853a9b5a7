// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the helios render project. All rights reserved.

//! Pixel sampling: filter tables and the adaptive per-pixel sample
//! loop. The table predetermines up to `max_samples` sub-pixel
//! positions; the sampler walks them in order and may stop early once
//! the pixel's sample values settle, so weights stay raw here and the
//! consumer normalizes by the sum it actually accumulated.

use helios_data::geom::Color;

use crate::qmc;
use crate::types::{FILTER_GAUSSIAN, FILTER_TRIANGLE};

/// One sub-pixel sample position with its filter weight.
#[derive(Debug, Clone, Copy)]
pub struct FilterSample {
    pub dx: f32,
    pub dy: f32,
    pub weight: f32,
}

/// Precomputed sample pattern shared by all pixels of a bucket. Radius
/// zero degenerates to a single centered sample.
#[derive(Debug, Clone, Default)]
pub struct FilterTable {
    samples: Vec<FilterSample>,
}

impl FilterTable {
    pub fn new(filter: i32, radius: f32, max_samples: i32) -> FilterTable {
        let n = if radius <= 0.0 {
            1
        } else {
            max_samples.max(1) as u32
        };

        let mut samples = Vec::with_capacity(n as usize);
        for i in 0..n {
            let (u, v) = if n == 1 {
                (0.5, 0.5)
            } else {
                qmc::halton_2d(i + 1)
            };
            let dx = (u - 0.5) * (2.0 * radius).max(1.0);
            let dy = (v - 0.5) * (2.0 * radius).max(1.0);
            samples.push(FilterSample {
                dx,
                dy,
                weight: filter_weight(filter, radius, dx, dy),
            });
        }
        FilterTable { samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn get(&self, index: usize) -> &FilterSample {
        &self.samples[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &FilterSample> {
        self.samples.iter()
    }
}

fn filter_weight(filter: i32, radius: f32, dx: f32, dy: f32) -> f32 {
    if radius <= 0.0 {
        return 1.0;
    }
    match filter {
        FILTER_TRIANGLE => {
            let fx = (1.0 - (dx / radius).abs()).max(0.0);
            let fy = (1.0 - (dy / radius).abs()).max(0.0);
            fx * fy
        }
        FILTER_GAUSSIAN => {
            let alpha = 2.0;
            let r2 = dx * dx + dy * dy;
            (-alpha * r2).exp() - (-alpha * radius * radius).exp().max(0.0)
        }
        _ => 1.0,
    }
}

/// Running state of one pixel under adaptive sampling: weighted color
/// and coverage plus the luminance span used by the contrast test.
#[derive(Debug, Default, Clone, Copy)]
pub struct PixelAccum {
    color: Color,
    alpha: f32,
    weight: f32,
    taken: usize,
    lum_min: f32,
    lum_max: f32,
}

impl PixelAccum {
    pub fn new() -> PixelAccum {
        PixelAccum {
            lum_min: f32::INFINITY,
            lum_max: f32::NEG_INFINITY,
            ..Default::default()
        }
    }

    pub fn add(&mut self, sample: &FilterSample, color: Color, alpha: f32) {
        self.color += color * sample.weight;
        self.alpha += alpha * sample.weight;
        self.weight += sample.weight;
        self.taken += 1;

        let lum = color.luminance();
        self.lum_min = self.lum_min.min(lum);
        self.lum_max = self.lum_max.max(lum);
    }

    pub fn taken(&self) -> usize {
        self.taken
    }

    /// Whether the pixel may stop early: at least `min_samples` taken
    /// and the observed luminance span within the contrast threshold.
    pub fn converged(&self, min_samples: i32, contrast: f32) -> bool {
        self.taken as i32 >= min_samples.max(1) && self.lum_max - self.lum_min <= contrast
    }

    /// Filter-normalized pixel value.
    pub fn resolve(&self) -> (Color, f32) {
        if self.weight <= 0.0 {
            return (Color::default(), 0.0);
        }
        let inv = 1.0 / self.weight;
        (self.color * inv, self.alpha * inv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FILTER_BOX;

    #[test]
    fn test_radius_zero_single_sample() {
        let table = FilterTable::new(FILTER_BOX, 0.0, 16);
        assert_eq!(table.len(), 1);
        let s = table.get(0);
        assert_eq!((s.dx, s.dy), (0.0, 0.0));
        assert_eq!(s.weight, 1.0);
    }

    #[test]
    fn test_weights_are_positive() {
        for filter in [FILTER_BOX, FILTER_TRIANGLE, FILTER_GAUSSIAN] {
            let table = FilterTable::new(filter, 1.5, 8);
            assert_eq!(table.len(), 8);
            assert!(table.iter().all(|s| s.weight >= 0.0));
            assert!(table.iter().any(|s| s.weight > 0.0));
        }
    }

    #[test]
    fn test_samples_stay_inside_support() {
        let table = FilterTable::new(FILTER_TRIANGLE, 2.0, 32);
        for s in table.iter() {
            assert!(s.dx.abs() <= 2.0 && s.dy.abs() <= 2.0);
        }
    }

    #[test]
    fn test_flat_field_resolves_flat() {
        let table = FilterTable::new(FILTER_GAUSSIAN, 1.0, 8);
        let mut accum = PixelAccum::new();
        for s in table.iter() {
            accum.add(s, Color::gray(0.25), 1.0);
        }
        let (color, alpha) = accum.resolve();
        assert!((color.r - 0.25).abs() < 1e-6);
        assert!((alpha - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_contrast_convergence() {
        let table = FilterTable::new(FILTER_BOX, 1.0, 16);
        let mut accum = PixelAccum::new();

        // A flat pixel settles as soon as the floor allows.
        accum.add(table.get(0), Color::gray(0.5), 1.0);
        assert!(!accum.converged(2, 0.05));
        accum.add(table.get(1), Color::gray(0.5), 1.0);
        assert!(accum.converged(2, 0.05));

        // A contrasty sample reopens the pixel.
        accum.add(table.get(2), Color::gray(0.9), 1.0);
        assert!(!accum.converged(2, 0.05));
        assert!(accum.converged(2, 0.5));
    }
}
