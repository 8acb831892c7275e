//! Image preprocessing ahead of OCR.
//!
//! The pipeline is a sequence of independent stages; any stage that fails
//! falls back to its input so a broken image never blocks extraction, it
//! just reaches the engine less polished.

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, Luma};
use tokio::process::Command;
use tracing::debug;

use crate::config::Config;
use crate::ocr::command_available;

const MAX_OCR_DIMENSION: u32 = 3000;
const DESKEW_MIN_ANGLE_DEG: f64 = 0.5;
const DESKEW_MAX_ANGLE_DEG: f64 = 15.0;

/// Full preprocessing pipeline. Returns PNG-encoded bytes ready for an OCR
/// engine; on total decode failure the original bytes pass through.
pub async fn preprocess_image(config: &Config, bytes: &[u8]) -> Vec<u8> {
    let bytes = convert_heic_if_needed(config, bytes).await;

    let decoded = match image::load_from_memory(&bytes) {
        Ok(img) => img,
        Err(e) => {
            debug!(error = %e, "Preprocess decode failed, passing original bytes");
            return bytes;
        }
    };

    // Orientation correction must precede every geometric stage.
    let oriented = apply_exif_orientation(decoded, &bytes);
    let mut gray = oriented.to_luma8();

    if let Some(angle) = estimate_skew_angle(&gray) {
        if angle.abs() > DESKEW_MIN_ANGLE_DEG {
            gray = rotate_gray(&gray, -angle);
            debug!(angle, "Image deskewed");
        }
    }

    let binary = adaptive_gaussian_threshold(&gray, 11, 2.0);
    let opened = morphological_open_2x2(&binary);
    let enhanced = clahe(&opened, 2.0, 8, 8);
    let sized = downscale_if_needed(enhanced, MAX_OCR_DIMENSION);

    encode_png(&sized).unwrap_or(bytes)
}

fn encode_png(gray: &GrayImage) -> Option<Vec<u8>> {
    let mut out = std::io::Cursor::new(Vec::new());
    DynamicImage::ImageLuma8(gray.clone())
        .write_to(&mut out, image::ImageFormat::Png)
        .ok()?;
    Some(out.into_inner())
}

/// HEIC/HEIF container sniff: ISO-BMFF `ftyp` box with a heif brand.
pub fn is_heic(bytes: &[u8]) -> bool {
    if bytes.len() < 12 || &bytes[4..8] != b"ftyp" {
        return false;
    }
    matches!(&bytes[8..12], b"heic" | b"heix" | b"hevc" | b"heif" | b"mif1" | b"msf1")
}

/// Convert HEIC to PNG through the configured sidecar. Absent sidecar or a
/// failed conversion falls back to the original bytes.
async fn convert_heic_if_needed(config: &Config, bytes: &[u8]) -> Vec<u8> {
    if !is_heic(bytes) {
        return bytes.to_vec();
    }
    if !command_available(&config.heif_convert_cmd) {
        debug!("HEIC upload but no converter available");
        return bytes.to_vec();
    }

    let dir = std::env::temp_dir();
    let stem = uuid::Uuid::new_v4();
    let src = dir.join(format!("{stem}.heic"));
    let dst = dir.join(format!("{stem}.png"));

    let result = async {
        tokio::fs::write(&src, bytes).await.ok()?;
        let status = Command::new(&config.heif_convert_cmd)
            .arg(&src)
            .arg(&dst)
            .output()
            .await
            .ok()?;
        if !status.status.success() {
            return None;
        }
        tokio::fs::read(&dst).await.ok()
    }
    .await;

    let _ = tokio::fs::remove_file(&src).await;
    let _ = tokio::fs::remove_file(&dst).await;

    match result {
        Some(png) => {
            debug!(original = bytes.len(), png = png.len(), "HEIC converted to PNG");
            png
        }
        None => bytes.to_vec(),
    }
}

/// EXIF orientation tag (0x0112) from a JPEG APP1 segment, when present.
pub fn exif_orientation(bytes: &[u8]) -> Option<u16> {
    // JPEG SOI then marker scan for APP1/Exif.
    if bytes.len() < 4 || bytes[0] != 0xFF || bytes[1] != 0xD8 {
        return None;
    }
    let mut i = 2usize;
    while i + 4 <= bytes.len() {
        if bytes[i] != 0xFF {
            return None;
        }
        let marker = bytes[i + 1];
        let seg_len = u16::from_be_bytes([bytes[i + 2], bytes[i + 3]]) as usize;
        if marker == 0xE1 && i + 4 + 6 <= bytes.len() && &bytes[i + 4..i + 10] == b"Exif\0\0" {
            return parse_tiff_orientation(&bytes[i + 10..i + 2 + seg_len.min(bytes.len() - i - 2)]);
        }
        // SOS: image data follows, no more metadata segments.
        if marker == 0xDA {
            return None;
        }
        i += 2 + seg_len;
    }
    None
}

fn parse_tiff_orientation(tiff: &[u8]) -> Option<u16> {
    if tiff.len() < 8 {
        return None;
    }
    let big_endian = match &tiff[0..2] {
        b"MM" => true,
        b"II" => false,
        _ => return None,
    };
    let read_u16 = |b: &[u8]| -> u16 {
        if big_endian {
            u16::from_be_bytes([b[0], b[1]])
        } else {
            u16::from_le_bytes([b[0], b[1]])
        }
    };
    let read_u32 = |b: &[u8]| -> u32 {
        if big_endian {
            u32::from_be_bytes([b[0], b[1], b[2], b[3]])
        } else {
            u32::from_le_bytes([b[0], b[1], b[2], b[3]])
        }
    };

    let ifd_offset = read_u32(&tiff[4..8]) as usize;
    if ifd_offset + 2 > tiff.len() {
        return None;
    }
    let entry_count = read_u16(&tiff[ifd_offset..ifd_offset + 2]) as usize;
    for n in 0..entry_count {
        let entry = ifd_offset + 2 + n * 12;
        if entry + 12 > tiff.len() {
            return None;
        }
        if read_u16(&tiff[entry..entry + 2]) == 0x0112 {
            return Some(read_u16(&tiff[entry + 8..entry + 10]));
        }
    }
    None
}

/// Apply all eight EXIF orientations.
fn apply_exif_orientation(image: DynamicImage, original_bytes: &[u8]) -> DynamicImage {
    match exif_orientation(original_bytes) {
        Some(2) => image.fliph(),
        Some(3) => image.rotate180(),
        Some(4) => image.flipv(),
        Some(5) => image.rotate90().fliph(),
        Some(6) => image.rotate90(),
        Some(7) => image.rotate270().fliph(),
        Some(8) => image.rotate270(),
        _ => image,
    }
}

/// Dominant text-line angle via a Hough vote over edge pixels, restricted to
/// near-horizontal normals. Returns the skew in degrees, or `None` when the
/// vote is too thin to trust.
pub fn estimate_skew_angle(gray: &GrayImage) -> Option<f64> {
    let (w, h) = gray.dimensions();
    if w < 32 || h < 32 {
        return None;
    }

    // Probe on a downscaled copy; angle estimation does not need full
    // resolution and the accumulator stays small.
    let probe = if w > 1000 {
        let scale = 1000.0 / w as f64;
        image::imageops::resize(
            gray,
            1000,
            ((h as f64 * scale) as u32).max(1),
            FilterType::Triangle,
        )
    } else {
        gray.clone()
    };
    let (pw, ph) = probe.dimensions();

    // Edge pixels: strong vertical gradient marks the top/bottom of glyphs.
    let mut edges = Vec::new();
    for y in 1..ph - 1 {
        for x in 0..pw {
            let above = probe.get_pixel(x, y - 1)[0] as i32;
            let below = probe.get_pixel(x, y + 1)[0] as i32;
            if (above - below).abs() > 60 {
                edges.push((x as f64, y as f64));
            }
        }
    }
    if edges.len() < 200 {
        return None;
    }

    let steps = (2.0 * DESKEW_MAX_ANGLE_DEG / 0.5) as usize + 1;
    let diag = ((pw * pw + ph * ph) as f64).sqrt();
    let rho_bins = diag as usize + 1;
    let mut accumulator = vec![vec![0u32; rho_bins]; steps];

    for &(x, y) in edges.iter().step_by(edges.len() / 4000 + 1) {
        for (t, acc_row) in accumulator.iter_mut().enumerate() {
            let angle_deg = -DESKEW_MAX_ANGLE_DEG + t as f64 * 0.5;
            // Normal of a near-horizontal line sits near 90 degrees.
            let theta = (90.0 + angle_deg).to_radians();
            let rho = x * theta.cos() + y * theta.sin();
            if rho >= 0.0 && (rho as usize) < rho_bins {
                acc_row[rho as usize] += 1;
            }
        }
    }

    // Score each angle by its strongest few lines rather than the total
    // (the total is angle-invariant).
    let mut best_angle = 0.0;
    let mut best_score = 0u32;
    for (t, acc_row) in accumulator.iter().enumerate() {
        let mut top: Vec<u32> = acc_row.iter().copied().collect();
        top.sort_unstable_by(|a, b| b.cmp(a));
        let score: u32 = top.iter().take(8).sum();
        if score > best_score {
            best_score = score;
            best_angle = -DESKEW_MAX_ANGLE_DEG + t as f64 * 0.5;
        }
    }

    Some(best_angle)
}

/// Rotate by `angle_deg` about the center with bilinear sampling and
/// replicated borders.
pub fn rotate_gray(gray: &GrayImage, angle_deg: f64) -> GrayImage {
    let (w, h) = gray.dimensions();
    let (cx, cy) = (w as f64 / 2.0, h as f64 / 2.0);
    let rad = angle_deg.to_radians();
    let (sin, cos) = rad.sin_cos();

    GrayImage::from_fn(w, h, |x, y| {
        // Inverse mapping: destination pixel pulled from source.
        let dx = x as f64 - cx;
        let dy = y as f64 - cy;
        let sx = cos * dx + sin * dy + cx;
        let sy = -sin * dx + cos * dy + cy;

        let x0 = sx.floor();
        let y0 = sy.floor();
        let fx = sx - x0;
        let fy = sy - y0;

        let sample = |px: f64, py: f64| -> f64 {
            let cx = px.clamp(0.0, (w - 1) as f64) as u32;
            let cy = py.clamp(0.0, (h - 1) as f64) as u32;
            gray.get_pixel(cx, cy)[0] as f64
        };

        let value = sample(x0, y0) * (1.0 - fx) * (1.0 - fy)
            + sample(x0 + 1.0, y0) * fx * (1.0 - fy)
            + sample(x0, y0 + 1.0) * (1.0 - fx) * fy
            + sample(x0 + 1.0, y0 + 1.0) * fx * fy;
        Luma([value.round().clamp(0.0, 255.0) as u8])
    })
}

/// Adaptive Gaussian threshold: a pixel is foreground when it exceeds the
/// Gaussian-smoothed local mean minus `c`.
pub fn adaptive_gaussian_threshold(gray: &GrayImage, block_size: u32, c: f64) -> GrayImage {
    let sigma = block_size as f32 / 4.0;
    let blurred = image::imageops::blur(gray, sigma);
    let (w, h) = gray.dimensions();
    GrayImage::from_fn(w, h, |x, y| {
        let local_mean = blurred.get_pixel(x, y)[0] as f64;
        if gray.get_pixel(x, y)[0] as f64 > local_mean - c {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

/// 2x2 morphological opening (erosion then dilation) on a binary image.
pub fn morphological_open_2x2(binary: &GrayImage) -> GrayImage {
    let (w, h) = binary.dimensions();
    if w < 2 || h < 2 {
        return binary.clone();
    }
    let window_min = |img: &GrayImage, x: u32, y: u32| -> u8 {
        let x1 = (x + 1).min(w - 1);
        let y1 = (y + 1).min(h - 1);
        img.get_pixel(x, y)[0]
            .min(img.get_pixel(x1, y)[0])
            .min(img.get_pixel(x, y1)[0])
            .min(img.get_pixel(x1, y1)[0])
    };
    let eroded = GrayImage::from_fn(w, h, |x, y| Luma([window_min(binary, x, y)]));

    let window_max = |img: &GrayImage, x: u32, y: u32| -> u8 {
        let x0 = x.saturating_sub(1);
        let y0 = y.saturating_sub(1);
        img.get_pixel(x, y)[0]
            .max(img.get_pixel(x0, y)[0])
            .max(img.get_pixel(x, y0)[0])
            .max(img.get_pixel(x0, y0)[0])
    };
    GrayImage::from_fn(w, h, |x, y| Luma([window_max(&eroded, x, y)]))
}

/// Contrast-limited adaptive histogram equalization over a tile grid with
/// bilinear blending between tile mappings.
pub fn clahe(gray: &GrayImage, clip_limit: f64, tiles_x: u32, tiles_y: u32) -> GrayImage {
    let (w, h) = gray.dimensions();
    if w < tiles_x || h < tiles_y {
        return gray.clone();
    }
    let tile_w = w.div_ceil(tiles_x);
    let tile_h = h.div_ceil(tiles_y);

    // Per-tile clipped-histogram CDF lookup tables.
    let mut luts = vec![[0u8; 256]; (tiles_x * tiles_y) as usize];
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            let x1 = (x0 + tile_w).min(w);
            let y1 = (y0 + tile_h).min(h);

            let mut hist = [0u32; 256];
            let mut count = 0u32;
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[gray.get_pixel(x, y)[0] as usize] += 1;
                    count += 1;
                }
            }
            if count == 0 {
                continue;
            }

            let clip = ((clip_limit * count as f64 / 256.0) as u32).max(1);
            let mut excess = 0u32;
            for bin in hist.iter_mut() {
                if *bin > clip {
                    excess += *bin - clip;
                    *bin = clip;
                }
            }
            let bonus = excess / 256;
            for bin in hist.iter_mut() {
                *bin += bonus;
            }

            let lut = &mut luts[(ty * tiles_x + tx) as usize];
            let mut cdf = 0u64;
            for (level, bin) in hist.iter().enumerate() {
                cdf += *bin as u64;
                lut[level] = ((cdf * 255) / count as u64).min(255) as u8;
            }
        }
    }

    GrayImage::from_fn(w, h, |x, y| {
        let value = gray.get_pixel(x, y)[0] as usize;

        // Position in tile-center space.
        let fx = (x as f64 / tile_w as f64 - 0.5).clamp(0.0, tiles_x as f64 - 1.0);
        let fy = (y as f64 / tile_h as f64 - 0.5).clamp(0.0, tiles_y as f64 - 1.0);
        let tx0 = fx.floor() as u32;
        let ty0 = fy.floor() as u32;
        let tx1 = (tx0 + 1).min(tiles_x - 1);
        let ty1 = (ty0 + 1).min(tiles_y - 1);
        let wx = fx - tx0 as f64;
        let wy = fy - ty0 as f64;

        let lut_at = |tx: u32, ty: u32| luts[(ty * tiles_x + tx) as usize][value] as f64;
        let blended = lut_at(tx0, ty0) * (1.0 - wx) * (1.0 - wy)
            + lut_at(tx1, ty0) * wx * (1.0 - wy)
            + lut_at(tx0, ty1) * (1.0 - wx) * wy
            + lut_at(tx1, ty1) * wx * wy;
        Luma([blended.round().clamp(0.0, 255.0) as u8])
    })
}

/// Downscale so neither dimension exceeds `max_dim`, with Lanczos3.
pub fn downscale_if_needed(gray: GrayImage, max_dim: u32) -> GrayImage {
    let (w, h) = gray.dimensions();
    if w <= max_dim && h <= max_dim {
        return gray;
    }
    let scale = max_dim as f64 / w.max(h) as f64;
    image::imageops::resize(
        &gray,
        ((w as f64 * scale) as u32).max(1),
        ((h as f64 * scale) as u32).max(1),
        FilterType::Lanczos3,
    )
}
