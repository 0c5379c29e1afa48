/// Force a kernel size to a positive odd integer
#[inline]
pub fn odd_kernel(size: u32) -> u32 {
    let size = size.max(1);
    if size % 2 == 0 {
        size + 1
    } else {
        size
    }
}

/// Sigma implied by a kernel size when none is given
#[inline]
fn sigma_for(ksize: u32) -> f32 {
    0.3 * ((ksize as f32 - 1.0) * 0.5 - 1.0) + 0.8
}

/// Normalised 1-D Gaussian weights. `sigma <= 0` derives sigma from `ksize`.
pub fn gaussian_kernel(ksize: u32, sigma: f32) -> Vec<f32> {
    let ksize = odd_kernel(ksize);
    let sigma = if sigma > 0.0 { sigma } else { sigma_for(ksize) };
    let half = (ksize / 2) as i32;
    let scale = -0.5 / (sigma * sigma);
    let mut weights: Vec<f32> = (-half..=half)
        .map(|i| ((i * i) as f32 * scale).exp())
        .collect();
    let sum: f32 = weights.iter().sum();
    for w in &mut weights {
        *w /= sum;
    }
    weights
}

/// Mirror an out-of-range index around the edge pixel (`dcb|abcd|cba`)
#[inline]
fn reflect(index: i64, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let last = len as i64 - 1;
    let mut i = index;
    // Kernels wider than the image can need more than one reflection.
    loop {
        if i < 0 {
            i = -i;
        } else if i > last {
            i = 2 * last - i;
        } else {
            return i as usize;
        }
    }
}

/// Separable Gaussian convolution over f32 samples
fn convolve_separable(
    src: &[f32],
    width: usize,
    height: usize,
    channels: usize,
    kernel: &[f32],
) -> Vec<f32> {
    let half = (kernel.len() / 2) as i64;
    let row_len = width * channels;
    let mut horizontal = vec![0.0f32; src.len()];

    for y in 0..height {
        let row = &src[y * row_len..(y + 1) * row_len];
        let out = &mut horizontal[y * row_len..(y + 1) * row_len];
        for x in 0..width {
            for c in 0..channels {
                let mut acc = 0.0;
                for (k, w) in kernel.iter().enumerate() {
                    let sx = reflect(x as i64 + k as i64 - half, width);
                    acc += row[sx * channels + c] * w;
                }
                out[x * channels + c] = acc;
            }
        }
    }

    let mut output = vec![0.0f32; src.len()];
    for y in 0..height {
        let out = &mut output[y * row_len..(y + 1) * row_len];
        for (k, w) in kernel.iter().enumerate() {
            let sy = reflect(y as i64 + k as i64 - half, height);
            let row = &horizontal[sy * row_len..(sy + 1) * row_len];
            for (o, s) in out.iter_mut().zip(row) {
                *o += s * w;
            }
        }
    }
    output
}

/// Gaussian blur over 8-bit interleaved pixels
pub fn gaussian_blur_u8(
    src: &[u8],
    width: u32,
    height: u32,
    channels: usize,
    ksize: u32,
    sigma: f32,
) -> Vec<u8> {
    let kernel = gaussian_kernel(ksize, sigma);
    if kernel.len() == 1 || src.is_empty() {
        return src.to_vec();
    }
    let samples: Vec<f32> = src.iter().map(|&v| v as f32).collect();
    convolve_separable(&samples, width as usize, height as usize, channels, &kernel)
        .into_iter()
        .map(|v| v.round().clamp(0.0, 255.0) as u8)
        .collect()
}

/// Gaussian blur over single-channel float samples
pub fn gaussian_blur_f32(src: &[f32], width: u32, height: u32, ksize: u32, sigma: f32) -> Vec<f32> {
    let kernel = gaussian_kernel(ksize, sigma);
    if kernel.len() == 1 || src.is_empty() {
        return src.to_vec();
    }
    convolve_separable(src, width as usize, height as usize, 1, &kernel)
}

/// Offsets of an elliptical structuring element of odd `size`
pub fn ellipse_element(size: u32) -> Vec<(i32, i32)> {
    let size = odd_kernel(size) as i32;
    let r = size / 2;
    if r == 0 {
        return vec![(0, 0)];
    }
    let mut offsets = Vec::new();
    for dy in -r..=r {
        let span = ((r * r - dy * dy) as f64 / (r * r) as f64).sqrt() * r as f64;
        let dx_max = span.round() as i32;
        for dx in -dx_max..=dx_max {
            offsets.push((dx, dy));
        }
    }
    offsets
}

fn morph(src: &[u8], width: u32, height: u32, element: &[(i32, i32)], dilate: bool) -> Vec<u8> {
    let (w, h) = (width as i32, height as i32);
    let mut out = vec![0u8; src.len()];
    for y in 0..h {
        for x in 0..w {
            let mut value = if dilate { u8::MIN } else { u8::MAX };
            for &(dx, dy) in element {
                let (sx, sy) = (x + dx, y + dy);
                // Out-of-image samples never win the min/max.
                if sx < 0 || sy < 0 || sx >= w || sy >= h {
                    continue;
                }
                let v = src[(sy * w + sx) as usize];
                value = if dilate { value.max(v) } else { value.min(v) };
            }
            out[(y * w + x) as usize] = value;
        }
    }
    out
}

/// Morphological closing (dilate then erode) of a single-channel image
pub fn morphological_close(src: &[u8], width: u32, height: u32, element_size: u32) -> Vec<u8> {
    let element = ellipse_element(element_size);
    let dilated = morph(src, width, height, &element, true);
    morph(&dilated, width, height, &element, false)
}

/// Edge-preserving bilateral filter over 3-channel pixels
///
/// `diameter` is the pixel neighbourhood; samples outside the inscribed
/// circle are skipped.
pub fn bilateral_filter(
    src: &[u8],
    width: u32,
    height: u32,
    diameter: u32,
    sigma_color: f32,
    sigma_space: f32,
) -> Vec<u8> {
    let radius = (diameter / 2).max(1) as i32;
    let color_coeff = -0.5 / (sigma_color * sigma_color);
    let space_coeff = -0.5 / (sigma_space * sigma_space);

    // Colour distance is the sum of absolute channel differences.
    let color_weights: Vec<f32> = (0..(256 * 3))
        .map(|d| ((d * d) as f32 * color_coeff).exp())
        .collect();

    let mut window = Vec::new();
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            let r2 = dx * dx + dy * dy;
            if r2 <= radius * radius {
                window.push((dx, dy, (r2 as f32 * space_coeff).exp()));
            }
        }
    }

    let (w, h) = (width as usize, height as usize);
    let mut out = vec![0u8; src.len()];
    for y in 0..h {
        for x in 0..w {
            let center = (y * w + x) * 3;
            let c = &src[center..center + 3];
            let mut acc = [0.0f32; 3];
            let mut weight_sum = 0.0f32;
            for &(dx, dy, space_weight) in &window {
                let sx = reflect(x as i64 + dx as i64, w);
                let sy = reflect(y as i64 + dy as i64, h);
                let idx = (sy * w + sx) * 3;
                let p = &src[idx..idx + 3];
                let dist = (p[0] as i32 - c[0] as i32).unsigned_abs()
                    + (p[1] as i32 - c[1] as i32).unsigned_abs()
                    + (p[2] as i32 - c[2] as i32).unsigned_abs();
                let weight = space_weight * color_weights[dist as usize];
                acc[0] += p[0] as f32 * weight;
                acc[1] += p[1] as f32 * weight;
                acc[2] += p[2] as f32 * weight;
                weight_sum += weight;
            }
            for ch in 0..3 {
                out[center + ch] = (acc[ch] / weight_sum).round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    out
}

/// Square median filter over 8-bit interleaved pixels, per channel
pub fn median_filter_u8(src: &[u8], width: u32, height: u32, channels: usize, ksize: u32) -> Vec<u8> {
    let ksize = odd_kernel(ksize);
    if ksize == 1 || src.is_empty() {
        return src.to_vec();
    }
    let half = (ksize / 2) as i64;
    let (w, h) = (width as usize, height as usize);
    let mut window = Vec::with_capacity((ksize * ksize) as usize);
    let mut out = vec![0u8; src.len()];
    for y in 0..h {
        for x in 0..w {
            for c in 0..channels {
                window.clear();
                for dy in -half..=half {
                    let sy = reflect(y as i64 + dy, h);
                    for dx in -half..=half {
                        let sx = reflect(x as i64 + dx, w);
                        window.push(src[(sy * w + sx) * channels + c]);
                    }
                }
                let mid = window.len() / 2;
                out[(y * w + x) * channels + c] = *window.select_nth_unstable(mid).1;
            }
        }
    }
    out
}
