//! CPU reference implementations of what the shaders do on the GPU.

use std::path::Path;

use crate::types::{
    error::{Nv12Error, Result},
    frame::Nv12Frame,
};

/// YUV to RGB matrix used by [`nv12_to_rgb`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Matrix {
    /// Studio swing BT.601 in 8.8 fixed point.
    Bt601Limited,
    /// Full swing BT.601, the formula the GLES fragment shader uses.
    Bt601Full,
}

/// Converts one NV12 frame into packed RGB24, `width * height * 3` bytes.
pub fn nv12_to_rgb(frame: &Nv12Frame, matrix: Matrix) -> Vec<u8> {
    let width = frame.width() as usize;
    let height = frame.height() as usize;
    let y_plane = frame.y_plane();
    let uv_plane = frame.uv_plane();

    let mut rgb = vec![0u8; width * height * 3];
    for row in 0..height {
        for col in 0..width {
            let y_index = row * width + col;
            // Each chroma row is `width` bytes of U,V pairs shared by two luma rows.
            let uv_index = (row / 2) * width + (col & !1);

            let pixel = yuv_to_rgb(
                y_plane[y_index],
                uv_plane[uv_index],
                uv_plane[uv_index + 1],
                matrix,
            );
            rgb[y_index * 3..y_index * 3 + 3].copy_from_slice(&pixel);
        }
    }
    rgb
}

pub fn yuv_to_rgb(y: u8, u: u8, v: u8, matrix: Matrix) -> [u8; 3] {
    match matrix {
        Matrix::Bt601Limited => {
            let c = y as i32 - 16;
            let d = u as i32 - 128;
            let e = v as i32 - 128;

            let r = (298 * c + 409 * e + 128) >> 8;
            let g = (298 * c - 100 * d - 208 * e + 128) >> 8;
            let b = (298 * c + 516 * d + 128) >> 8;

            [clamp_i32(r), clamp_i32(g), clamp_i32(b)]
        }
        Matrix::Bt601Full => {
            let y = y as f32 / 255.0;
            let u = (u as f32 - 128.0) / 255.0;
            let v = (v as f32 - 128.0) / 255.0;

            let r = y + 1.402 * v;
            let g = y - 0.344136 * u - 0.714136 * v;
            let b = y + 1.772 * u;

            [clamp_unorm(r), clamp_unorm(g), clamp_unorm(b)]
        }
    }
}

fn clamp_i32(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

fn clamp_unorm(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Nearest neighbour NV12 scaling, matching `shaders/scale_y.comp` and
/// `shaders/scale_uv.comp`.
pub fn scale_nearest(frame: &Nv12Frame, out_width: u32, out_height: u32) -> Result<Nv12Frame> {
    let (in_w, in_h) = (frame.width() as usize, frame.height() as usize);
    let (out_w, out_h) = (out_width as usize, out_height as usize);
    if out_w < 2 || out_h < 2 || out_w % 2 != 0 || out_h % 2 != 0 {
        return Err(Nv12Error::Validation(format!(
            "cannot scale to {out_width}x{out_height}: NV12 needs even dimensions"
        )));
    }

    let mut y = vec![0u8; out_w * out_h];
    for row in 0..out_h {
        let src_row = row * in_h / out_h;
        for col in 0..out_w {
            let src_col = col * in_w / out_w;
            y[row * out_w + col] = frame.y_plane()[src_row * in_w + src_col];
        }
    }

    let (in_cw, in_ch) = (in_w / 2, in_h / 2);
    let (out_cw, out_ch) = (out_w / 2, out_h / 2);
    let mut uv = vec![0u8; out_w * out_h / 2];
    for row in 0..out_ch {
        let src_row = row * in_ch / out_ch;
        for col in 0..out_cw {
            let src_col = col * in_cw / out_cw;
            let src = (src_row * in_cw + src_col) * 2;
            let dst = (row * out_cw + col) * 2;
            uv[dst..dst + 2].copy_from_slice(&frame.uv_plane()[src..src + 2]);
        }
    }

    Nv12Frame::from_planes(out_width, out_height, y, uv)
}

/// Writes an RGB24 buffer as a PNG preview next to the raw output.
pub fn save_rgb_png<P: AsRef<Path>>(path: P, width: u32, height: u32, rgb: Vec<u8>) -> Result<()> {
    let image = image::RgbImage::from_raw(width, height, rgb).ok_or_else(|| {
        Nv12Error::Validation(format!("RGB buffer does not hold a {width}x{height} image"))
    })?;
    image.save(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn white_frame_converts_to_white() {
        let frame = Nv12Frame::white(64, 48).unwrap();
        for matrix in [Matrix::Bt601Limited, Matrix::Bt601Full] {
            let rgb = nv12_to_rgb(&frame, matrix);
            assert_eq!(rgb.len(), 64 * 48 * 3);
            assert!(rgb.iter().all(|&c| c == 255), "{matrix:?}");
        }
    }

    #[test]
    fn limited_range_black_and_grey() {
        assert_eq!(yuv_to_rgb(16, 128, 128, Matrix::Bt601Limited), [0, 0, 0]);
        assert_eq!(yuv_to_rgb(0, 128, 128, Matrix::Bt601Limited), [0, 0, 0]);
        let [r, g, b] = yuv_to_rgb(126, 128, 128, Matrix::Bt601Limited);
        assert!(r == g && g == b);
    }

    #[test]
    fn red_chroma_pushes_red_up() {
        let [r, g, b] = yuv_to_rgb(81, 90, 240, Matrix::Bt601Limited);
        assert!(r > 200);
        assert!(g < 60 && b < 60);
    }

    #[test]
    fn chroma_is_shared_by_two_by_two_blocks() {
        let mut uv = vec![128u8; 4 * 4 / 2];
        // Second pair of the first chroma row: pixels (2..4, 0..2).
        uv[2] = 90;
        uv[3] = 240;
        let frame = Nv12Frame::from_planes(4, 4, vec![128; 16], uv).unwrap();
        let rgb = nv12_to_rgb(&frame, Matrix::Bt601Limited);

        let px = |x: usize, y: usize| &rgb[(y * 4 + x) * 3..(y * 4 + x) * 3 + 3];
        assert_eq!(px(2, 0), px(3, 1));
        assert_ne!(px(0, 0), px(2, 0));
        assert_eq!(px(0, 2), px(3, 3));
    }

    #[test]
    fn scaling_to_the_same_size_is_identity() {
        let frame = Nv12Frame::checkerboard(64, 64).unwrap();
        assert_eq!(scale_nearest(&frame, 64, 64).unwrap(), frame);
    }

    #[test]
    fn halving_keeps_a_uniform_frame_uniform() {
        let frame = Nv12Frame::solid(640, 480, 81, 90, 240).unwrap();
        let scaled = scale_nearest(&frame, 320, 240).unwrap();
        assert_eq!(scaled, Nv12Frame::solid(320, 240, 81, 90, 240).unwrap());
    }

    #[test]
    fn halving_picks_every_other_sample() {
        let frame = Nv12Frame::checkerboard(128, 64).unwrap();
        let scaled = scale_nearest(&frame, 64, 32).unwrap();
        assert_eq!(scaled.y_plane()[0], frame.y_plane()[0]);
        assert_eq!(scaled.y_plane()[16], frame.y_plane()[32]);
        assert!(scale_nearest(&frame, 63, 32).is_err());
    }
}
