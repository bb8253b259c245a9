//! Image decoding and input tensor preparation.

use crate::error::MlError;
use crate::nn::{INPUT_CHANNELS, INPUT_SIZE};
use deepfly_core::ChannelOrder;
use image::RgbImage;
use image::imageops::FilterType;
use ndarray::Array4;

/// Decode any supported image format into 8-bit RGB.
pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage, MlError> {
    let image = image::load_from_memory(bytes)?;
    Ok(image.to_rgb8())
}

/// Resize to 256×256, scale to `[0, 1]`, apply the channel order and add
/// a leading batch axis: `[1, 256, 256, 3]`.
pub fn to_input_tensor(image: &RgbImage, order: ChannelOrder) -> Array4<f32> {
    let size = INPUT_SIZE as u32;
    let resized;
    let image = if image.dimensions() == (size, size) {
        image
    } else {
        resized = image::imageops::resize(image, size, size, FilterType::CatmullRom);
        &resized
    };

    Array4::from_shape_fn(
        (1, INPUT_SIZE, INPUT_SIZE, INPUT_CHANNELS),
        |(_, y, x, c)| {
            let pixel = image.get_pixel(x as u32, y as u32);
            let source = match order {
                ChannelOrder::Rgb => c,
                ChannelOrder::Bgr => INPUT_CHANNELS - 1 - c,
            };
            f32::from(pixel[source]) / 255.0
        },
    )
}

/// Decode and prepare uploaded bytes in one step.
pub fn preprocess(bytes: &[u8], order: ChannelOrder) -> Result<Array4<f32>, MlError> {
    let image = decode_rgb(bytes)?;
    Ok(to_input_tensor(&image, order))
}
