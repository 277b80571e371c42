//! Average-colour heuristic that labels a car detection as red.
//!
//! Pixels are read in R, G, B order as produced by [`image::RgbImage`]. A
//! detection is red when, over every pixel inside its box, the mean red
//! channel is above [`RED_CHANNEL_THRESHOLD`] and above both the mean green
//! and the mean blue channel. All comparisons are strict and are evaluated on
//! exact channel sums, so no floating point rounding is involved.

use crate::bounding_box::Detection;
use image::RgbImage;
use thiserror::Error;

/// Minimum mean red value (exclusive, 0-255 scale).
pub const RED_CHANNEL_THRESHOLD: u64 = 120;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HeuristicError {
    #[error("malformed bounding box ({x1}, {y1}, {x2}, {y2}): coordinates must be finite")]
    MalformedBox { x1: f32, y1: f32, x2: f32, y2: f32 },
}

/// Pixel window `[x, x + width) x [y, y + height)` inside the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    /// Truncates the box to whole pixels and clamps it to the image.
    ///
    /// Returns `None` for a region that is empty after clamping: zero-area,
    /// inverted, or entirely outside the image.
    pub fn clamped(
        detection: &Detection,
        image_width: u32,
        image_height: u32,
    ) -> Result<Option<Self>, HeuristicError> {
        let Detection { x1, y1, x2, y2, .. } = *detection;
        if ![x1, y1, x2, y2].iter().all(|c| c.is_finite()) {
            return Err(HeuristicError::MalformedBox { x1, y1, x2, y2 });
        }

        let left = clamp_coordinate(x1, image_width);
        let top = clamp_coordinate(y1, image_height);
        let right = clamp_coordinate(x2, image_width);
        let bottom = clamp_coordinate(y2, image_height);

        if right <= left || bottom <= top {
            return Ok(None);
        }

        Ok(Some(Self {
            x: left,
            y: top,
            width: right - left,
            height: bottom - top,
        }))
    }

    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

fn clamp_coordinate(value: f32, limit: u32) -> u32 {
    value.trunc().clamp(0.0, limit as f32) as u32
}

/// Per-channel sums over a region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelSums {
    pub red: u64,
    pub green: u64,
    pub blue: u64,
    pub pixels: u64,
}

impl ChannelSums {
    pub fn over(image: &RgbImage, region: Region) -> Self {
        let mut sums = ChannelSums {
            pixels: region.pixel_count(),
            ..Default::default()
        };
        for y in region.y..region.y + region.height {
            for x in region.x..region.x + region.width {
                let [r, g, b] = image.get_pixel(x, y).0;
                sums.red += r as u64;
                sums.green += g as u64;
                sums.blue += b as u64;
            }
        }
        sums
    }

    /// Mean `[red, green, blue]`, or `None` for an empty region.
    pub fn means(&self) -> Option<[f64; 3]> {
        if self.pixels == 0 {
            return None;
        }
        let n = self.pixels as f64;
        Some([
            self.red as f64 / n,
            self.green as f64 / n,
            self.blue as f64 / n,
        ])
    }

    pub fn is_red(&self) -> bool {
        self.pixels > 0
            && self.red > RED_CHANNEL_THRESHOLD * self.pixels
            && self.red > self.green
            && self.red > self.blue
    }
}

pub fn is_red_car(image: &RgbImage, detection: &Detection) -> Result<bool, HeuristicError> {
    let Some(region) = Region::clamped(detection, image.width(), image.height())? else {
        tracing::debug!(?detection, "Empty region after clamping, counted as not red");
        return Ok(false);
    };

    let sums = ChannelSums::over(image, region);
    let red = sums.is_red();
    if let Some([r, g, b]) = sums.means() {
        tracing::debug!(
            "Region {:?}: mean rgb=({:.1}, {:.1}, {:.1}), red={}",
            region,
            r,
            g,
            b,
            red
        );
    }
    Ok(red)
}

/// Counts the detections whose region is predominantly red.
pub fn count_red_cars(image: &RgbImage, cars: &[Detection]) -> Result<u32, HeuristicError> {
    let mut red_cars = 0;
    for car in cars {
        if is_red_car(image, car)? {
            red_cars += 1;
        }
    }
    Ok(red_cars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn car(x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection {
            class_id: 2,
            confidence: 0.8,
            x1,
            y1,
            x2,
            y2,
        }
    }

    fn uniform(color: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(40, 30, Rgb(color))
    }

    #[test]
    fn test_pure_red_region_is_red() {
        let image = uniform([255, 0, 0]);
        assert!(is_red_car(&image, &car(0.0, 0.0, 40.0, 30.0)).unwrap());
    }

    #[test]
    fn test_pure_blue_and_green_regions_are_not_red() {
        for color in [[0, 0, 255], [0, 255, 0]] {
            let image = uniform(color);
            assert!(!is_red_car(&image, &car(0.0, 0.0, 40.0, 30.0)).unwrap());
        }
    }

    #[test]
    fn test_mean_red_of_exactly_threshold_is_not_red() {
        let image = uniform([120, 0, 0]);
        assert!(!is_red_car(&image, &car(0.0, 0.0, 40.0, 30.0)).unwrap());

        let image = uniform([121, 0, 0]);
        assert!(is_red_car(&image, &car(0.0, 0.0, 40.0, 30.0)).unwrap());
    }

    #[test]
    fn test_mean_of_mixed_pixels_hits_threshold_exactly() {
        // Half 100, half 140: mean red is exactly 120.
        let mut image = uniform([100, 0, 0]);
        for y in 0..30 {
            for x in 20..40 {
                image.put_pixel(x, y, Rgb([140, 0, 0]));
            }
        }
        assert!(!is_red_car(&image, &car(0.0, 0.0, 40.0, 30.0)).unwrap());
        assert!(is_red_car(&image, &car(20.0, 0.0, 40.0, 30.0)).unwrap());
    }

    #[test]
    fn test_red_must_dominate_other_channels() {
        let image = uniform([200, 200, 0]);
        assert!(!is_red_car(&image, &car(0.0, 0.0, 40.0, 30.0)).unwrap());

        let image = uniform([200, 0, 201]);
        assert!(!is_red_car(&image, &car(0.0, 0.0, 40.0, 30.0)).unwrap());
    }

    #[test]
    fn test_only_pixels_inside_the_box_are_sampled() {
        let mut image = uniform([0, 0, 255]);
        for y in 10..20 {
            for x in 5..15 {
                image.put_pixel(x, y, Rgb([230, 20, 20]));
            }
        }
        assert!(is_red_car(&image, &car(5.0, 10.0, 15.0, 20.0)).unwrap());
        assert!(!is_red_car(&image, &car(0.0, 0.0, 40.0, 30.0)).unwrap());
    }

    #[test]
    fn test_zero_area_box_is_not_red() {
        let image = uniform([255, 0, 0]);
        assert_eq!(count_red_cars(&image, &[car(5.0, 5.0, 5.0, 20.0)]), Ok(0));
        assert_eq!(count_red_cars(&image, &[car(5.0, 5.0, 20.0, 5.0)]), Ok(0));
        assert_eq!(count_red_cars(&image, &[car(5.0, 5.0, 5.9, 20.0)]), Ok(0));
    }

    #[test]
    fn test_box_outside_image_is_not_red() {
        let image = uniform([255, 0, 0]);
        assert_eq!(
            Region::clamped(&car(50.0, 40.0, 90.0, 80.0), 40, 30),
            Ok(None)
        );
        assert!(!is_red_car(&image, &car(50.0, 40.0, 90.0, 80.0)).unwrap());
        assert!(!is_red_car(&image, &car(20.0, 20.0, 10.0, 10.0)).unwrap());
    }

    #[test]
    fn test_box_is_clamped_to_image_bounds() {
        let region = Region::clamped(&car(-3.7, 2.9, 55.0, 29.5), 40, 30)
            .unwrap()
            .unwrap();

        assert_eq!(
            region,
            Region {
                x: 0,
                y: 2,
                width: 40,
                height: 27
            }
        );
    }

    #[test]
    fn test_non_finite_box_is_an_error() {
        let image = uniform([255, 0, 0]);
        let err = count_red_cars(&image, &[car(0.0, f32::NAN, 10.0, 10.0)]).unwrap_err();
        assert!(matches!(err, HeuristicError::MalformedBox { .. }));

        assert!(is_red_car(&image, &car(0.0, 0.0, f32::INFINITY, 10.0)).is_err());
    }

    #[test]
    fn test_red_count_never_exceeds_detection_count() {
        let mut image = uniform([10, 10, 10]);
        for y in 0..15 {
            for x in 0..20 {
                image.put_pixel(x, y, Rgb([250, 30, 30]));
            }
        }
        let boxes = [
            car(0.0, 0.0, 20.0, 15.0),
            car(0.0, 0.0, 20.0, 15.0),
            car(20.0, 15.0, 40.0, 30.0),
            car(0.0, 0.0, 0.0, 0.0),
            car(-100.0, -100.0, 400.0, 300.0),
            car(2.0, 2.0, 12.0, 12.0),
        ];
        for len in 0..=boxes.len() {
            let red = count_red_cars(&image, &boxes[..len]).unwrap();
            assert!(red as usize <= len);
        }
        assert_eq!(count_red_cars(&image, &boxes).unwrap(), 3);
    }

    #[test]
    fn test_count_is_independent_of_order() {
        let mut image = uniform([0, 0, 200]);
        for y in 0..30 {
            for x in 0..10 {
                image.put_pixel(x, y, Rgb([255, 0, 0]));
            }
        }
        let mut boxes = vec![
            car(0.0, 0.0, 10.0, 30.0),
            car(10.0, 0.0, 40.0, 30.0),
            car(0.0, 0.0, 5.0, 5.0),
        ];
        let forward = count_red_cars(&image, &boxes).unwrap();
        boxes.reverse();
        assert_eq!(count_red_cars(&image, &boxes).unwrap(), forward);
        assert_eq!(forward, 2);
    }

    #[test]
    fn test_channel_means() {
        let image = uniform([30, 60, 90]);
        let region = Region {
            x: 0,
            y: 0,
            width: 4,
            height: 2,
        };
        let sums = ChannelSums::over(&image, region);

        assert_eq!(sums.pixels, 8);
        assert_eq!(sums.means(), Some([30.0, 60.0, 90.0]));
        assert_eq!(ChannelSums::default().means(), None);
        assert!(!ChannelSums::default().is_red());
    }
}
