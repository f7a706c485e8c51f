//! Pixel-level preparation of grayscale frames for the ONNX models.

use crate::types::BoundingBox;
use ndarray::Array4;

/// Placement of a resized frame inside a square model input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

impl Letterbox {
    /// Map a box from model-input space back to frame space.
    pub fn unmap(&self, x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> BoundingBox {
        let fx1 = (x1 - self.pad_x) / self.scale;
        let fy1 = (y1 - self.pad_y) / self.scale;
        let fx2 = (x2 - self.pad_x) / self.scale;
        let fy2 = (y2 - self.pad_y) / self.scale;
        BoundingBox {
            x: fx1,
            y: fy1,
            width: fx2 - fx1,
            height: fy2 - fy1,
            confidence,
        }
    }
}

/// Bilinear resize of a grayscale buffer.
pub fn resize_bilinear(src: &[u8], width: usize, height: usize, out_w: usize, out_h: usize) -> Vec<u8> {
    let mut out = vec![0u8; out_w * out_h];
    if out_w == 0 || out_h == 0 || width == 0 || height == 0 || src.len() < width * height {
        return out;
    }

    let sx = width as f32 / out_w as f32;
    let sy = height as f32 / out_h as f32;

    for (oy, row) in out.chunks_exact_mut(out_w).enumerate() {
        let fy = ((oy as f32 + 0.5) * sy - 0.5).clamp(0.0, (height - 1) as f32);
        let y0 = fy as usize;
        let y1 = (y0 + 1).min(height - 1);
        let wy = fy - y0 as f32;

        for (ox, px) in row.iter_mut().enumerate() {
            let fx = ((ox as f32 + 0.5) * sx - 0.5).clamp(0.0, (width - 1) as f32);
            let x0 = fx as usize;
            let x1 = (x0 + 1).min(width - 1);
            let wx = fx - x0 as f32;

            let top = src[y0 * width + x0] as f32 * (1.0 - wx) + src[y0 * width + x1] as f32 * wx;
            let bot = src[y1 * width + x0] as f32 * (1.0 - wx) + src[y1 * width + x1] as f32 * wx;
            *px = (top * (1.0 - wy) + bot * wy).round().clamp(0.0, 255.0) as u8;
        }
    }

    out
}

/// Fit a frame into a `size`×`size` square, centred, padding with `fill`.
pub fn letterbox(src: &[u8], width: usize, height: usize, size: usize, fill: u8) -> (Vec<u8>, Letterbox) {
    let scale = (size as f32 / width.max(1) as f32).min(size as f32 / height.max(1) as f32);
    let new_w = ((width as f32 * scale).round() as usize).clamp(1, size);
    let new_h = ((height as f32 * scale).round() as usize).clamp(1, size);
    let pad_x = (size - new_w) / 2;
    let pad_y = (size - new_h) / 2;

    let resized = resize_bilinear(src, width, height, new_w, new_h);
    let mut out = vec![fill; size * size];
    for (y, row) in resized.chunks_exact(new_w).enumerate() {
        let start = (y + pad_y) * size + pad_x;
        out[start..start + new_w].copy_from_slice(row);
    }

    (
        out,
        Letterbox {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
        },
    )
}

/// Crop `bbox` (grown by `margin` of its size on every side) and resize to `size`×`size`.
pub fn crop_face(src: &[u8], width: usize, height: usize, bbox: &BoundingBox, margin: f32, size: usize) -> Vec<u8> {
    if width == 0 || height == 0 || src.len() < width * height {
        return vec![0u8; size * size];
    }
    let grow_x = bbox.width * margin;
    let grow_y = bbox.height * margin;
    let x0 = (bbox.x - grow_x).floor().clamp(0.0, width as f32 - 1.0) as usize;
    let y0 = (bbox.y - grow_y).floor().clamp(0.0, height as f32 - 1.0) as usize;
    let x1 = (bbox.x + bbox.width + grow_x).ceil().clamp(x0 as f32 + 1.0, width as f32) as usize;
    let y1 = (bbox.y + bbox.height + grow_y).ceil().clamp(y0 as f32 + 1.0, height as f32) as usize;

    let (cw, ch) = (x1 - x0, y1 - y0);
    let mut crop = Vec::with_capacity(cw * ch);
    for y in y0..y1 {
        crop.extend_from_slice(&src[y * width + x0..y * width + x1]);
    }
    resize_bilinear(&crop, cw, ch, size, size)
}

/// Square grayscale buffer → normalized NCHW tensor, gray replicated into 3 channels.
pub fn to_nchw(gray: &[u8], size: usize, mean: f32, std: f32) -> Array4<f32> {
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for y in 0..size {
        for x in 0..size {
            let v = (gray.get(y * size + x).copied().unwrap_or(0) as f32 - mean) / std;
            for c in 0..3 {
                tensor[[0, c, y, x]] = v;
            }
        }
    }
    tensor
}

/// Greedy non-maximum suppression; result is sorted by descending confidence.
pub fn nms(mut boxes: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<BoundingBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}
