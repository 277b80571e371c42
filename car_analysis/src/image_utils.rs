use image::{imageops, imageops::FilterType, ImageError, ImageReader, RgbImage};
use ndarray::Array4;
use std::io::Cursor;

/// Decodes any supported format into an 8-bit RGB pixel grid.
pub fn decode_rgb(image_data: &[u8]) -> Result<RgbImage, ImageError> {
    let image_reader = ImageReader::new(Cursor::new(image_data)).with_guessed_format()?;
    let image = image_reader.decode()?;
    Ok(image.to_rgb8())
}

/// Resizes to `size`x`size` and lays the pixels out as a `[1, 3, size, size]` tensor.
///
/// `normalize` receives the channel index (0 = red) and the raw channel value.
pub fn to_nchw_tensor<F>(image: &RgbImage, size: u32, normalize: F) -> Array4<f32>
where
    F: Fn(usize, u8) -> f32,
{
    let resized = imageops::resize(image, size, size, FilterType::CatmullRom);
    let side = size as usize;
    let mut input = Array4::zeros((1, 3, side, side));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for (channel, value) in pixel.0.iter().enumerate() {
            input[[0, channel, y, x]] = normalize(channel, *value);
        }
    }
    input
}

#[cfg(test)]
pub(crate) fn encode_png(image: &RgbImage) -> Vec<u8> {
    let mut image_data: Vec<u8> = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut image_data), image::ImageFormat::Png)
        .unwrap();
    image_data
}
