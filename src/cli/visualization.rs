use crate::core::FaceBox;
use image::{GrayImage, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

/// Colour copy of `frame` with every detected face outlined.
pub fn annotate_detections(frame: &GrayImage, faces: &[FaceBox]) -> RgbImage {
    let mut img = image::DynamicImage::ImageLuma8(frame.clone()).to_rgb8();

    for face in faces {
        if face.width == 0 || face.height == 0 {
            continue;
        }
        let rect = Rect::at(face.x as i32, face.y as i32).of_size(face.width, face.height);
        draw_hollow_rect_mut(&mut img, rect, BOX_COLOR);

        // Second outline for visibility on large frames.
        if face.width > 2 && face.height > 2 {
            let inner = Rect::at(face.x as i32 + 1, face.y as i32 + 1).of_size(face.width - 2, face.height - 2);
            draw_hollow_rect_mut(&mut img, inner, BOX_COLOR);
        }
    }

    img
}
