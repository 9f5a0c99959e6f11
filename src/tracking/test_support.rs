//! Synthetic images for exercising the OpenCV paths in tests.

use opencv::core::{Mat, Rect, Scalar, CV_8UC1};
use opencv::imgproc;
use opencv::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Mid-gray canvas covered with random filled rectangles (lots of corners).
pub fn blocky_texture(width: i32, height: i32, seed: u64) -> Mat {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut image =
        Mat::new_rows_cols_with_default(height, width, CV_8UC1, Scalar::all(128.0)).unwrap();
    let n_blocks = (width * height / 900).max(50);
    for _ in 0..n_blocks {
        let w = rng.gen_range(6..40);
        let h = rng.gen_range(6..40);
        let x = rng.gen_range(0..width);
        let y = rng.gen_range(0..height);
        let value = rng.gen_range(0..=255) as f64;
        imgproc::rectangle(
            &mut image,
            Rect::new(x, y, w, h),
            Scalar::all(value),
            -1,
            imgproc::LINE_8,
            0,
        )
        .unwrap();
    }
    image
}

/// Independent per-pixel uniform noise.
pub fn pixel_noise(width: i32, height: i32, seed: u64) -> Mat {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut image =
        Mat::new_rows_cols_with_default(height, width, CV_8UC1, Scalar::all(0.0)).unwrap();
    for r in 0..height {
        for c in 0..width {
            *image.at_2d_mut::<u8>(r, c).unwrap() = rng.gen();
        }
    }
    image
}

/// Owned copy of a sub-rectangle.
pub fn crop(image: &Mat, x: i32, y: i32, width: i32, height: i32) -> Mat {
    Mat::roi(image, Rect::new(x, y, width, height))
        .unwrap()
        .try_clone()
        .unwrap()
}

/// Uniform canvas.
pub fn flat(width: i32, height: i32, value: f64) -> Mat {
    Mat::new_rows_cols_with_default(height, width, CV_8UC1, Scalar::all(value)).unwrap()
}
