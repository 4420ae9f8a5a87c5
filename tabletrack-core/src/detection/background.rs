//! Per-pixel running Gaussian background model.

use image::{GrayImage, Luma};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundConfig {
    /// Weight of the newest frame in the running mean and variance.
    pub learning_rate: f32,
    /// Squared-deviation multiple of the variance that counts as foreground.
    pub variance_threshold: f32,
    pub initial_variance: f32,
    pub min_variance: f32,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.005,
            variance_threshold: 35.0,
            initial_variance: 225.0,
            min_variance: 4.0,
        }
    }
}

/// Owned per stream; reset whenever the frame size changes.
#[derive(Debug, Clone)]
pub struct BackgroundModel {
    config: BackgroundConfig,
    width: u32,
    height: u32,
    mean: Vec<f32>,
    variance: Vec<f32>,
}

impl BackgroundModel {
    pub fn new(config: BackgroundConfig) -> Self {
        Self {
            config,
            width: 0,
            height: 0,
            mean: Vec::new(),
            variance: Vec::new(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        !self.mean.is_empty()
    }

    /// Foreground mask of `gray` against the model, then fold `gray` in.
    /// The first frame only seeds the model and yields an empty mask.
    pub fn apply(&mut self, gray: &GrayImage) -> GrayImage {
        let (w, h) = gray.dimensions();
        if (w, h) != (self.width, self.height) || !self.is_initialized() {
            self.width = w;
            self.height = h;
            self.mean = gray.as_raw().iter().map(|&v| v as f32).collect();
            self.variance = vec![self.config.initial_variance; self.mean.len()];
            return GrayImage::new(w, h);
        }

        let cfg = self.config;
        let data: Vec<u8> = self
            .mean
            .par_iter_mut()
            .zip(self.variance.par_iter_mut())
            .zip(gray.as_raw().par_iter())
            .map(|((mean, var), &px)| {
                let d = px as f32 - *mean;
                let foreground = d * d > cfg.variance_threshold * *var;
                *mean += cfg.learning_rate * d;
                *var = ((1.0 - cfg.learning_rate) * *var + cfg.learning_rate * d * d)
                    .max(cfg.min_variance);
                if foreground {
                    255
                } else {
                    0
                }
            })
            .collect();
        GrayImage::from_raw(w, h, data).unwrap_or_else(|| GrayImage::from_pixel(w, h, Luma([0])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_frame_seeds_the_model() {
        let mut model = BackgroundModel::new(BackgroundConfig::default());
        let frame = GrayImage::from_pixel(8, 8, Luma([40]));
        assert!(model.apply(&frame).pixels().all(|p| p.0[0] == 0));
        assert!(model.is_initialized());
    }

    #[test]
    fn bright_intruder_is_foreground() {
        let mut model = BackgroundModel::new(BackgroundConfig::default());
        let bg = GrayImage::from_pixel(8, 8, Luma([40]));
        model.apply(&bg);
        model.apply(&bg);

        let mut frame = bg.clone();
        frame.put_pixel(3, 3, Luma([250]));
        frame.put_pixel(5, 5, Luma([60]));
        let mask = model.apply(&frame);
        assert_eq!(mask.get_pixel(3, 3).0[0], 255);
        assert_eq!(mask.get_pixel(5, 5).0[0], 0);
        assert_eq!(mask.pixels().filter(|p| p.0[0] > 0).count(), 1);
    }

    #[test]
    fn size_change_reseeds() {
        let mut model = BackgroundModel::new(BackgroundConfig::default());
        model.apply(&GrayImage::from_pixel(8, 8, Luma([40])));
        let mask = model.apply(&GrayImage::from_pixel(4, 4, Luma([250])));
        assert_eq!(mask.dimensions(), (4, 4));
        assert!(mask.pixels().all(|p| p.0[0] == 0));
    }
}
