//! 2D convolution of predicted-counts images with PSF kernels.
//!
//! The output has the shape of the input image ("same" mode). Kernels have an
//! odd number of pixels along both axes and are centered on their middle pixel.

use ndarray::{Array2, ArrayView2, Zip};

/// Options for controlling the convolution
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvolveOptions {
    /// Whether to use parallel processing with rayon
    pub parallel: bool,

    /// Controls how pixels outside the image are treated
    pub edge_mode: EdgeMode,
}

impl Default for ConvolveOptions {
    fn default() -> Self {
        Self {
            parallel: true,
            edge_mode: EdgeMode::Constant(0.0),
        }
    }
}

/// Edge handling modes for convolution
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EdgeMode {
    /// Uses a constant value for pixels outside image bounds
    Constant(f64),

    /// Reflects the image at the edges
    Reflect,

    /// Wraps around to the other side of the image
    Wrap,

    /// Extends the edge pixels outward
    Extend,
}

/// Convolve an image with a kernel.
///
/// # Arguments
/// * `image` - Input image `(ny, nx)`
/// * `kernel` - Convolution kernel, odd shape
/// * `options` - Convolution options
pub fn convolve2d(
    image: ArrayView2<f64>,
    kernel: ArrayView2<f64>,
    options: ConvolveOptions,
) -> Array2<f64> {
    let mut output = Array2::zeros(image.dim());
    let pixel = |(i, j): (usize, usize), out: &mut f64| {
        *out = convolve_pixel(&image, &kernel, i, j, options.edge_mode);
    };
    if options.parallel {
        Zip::indexed(&mut output).par_for_each(pixel);
    } else {
        Zip::indexed(&mut output).for_each(pixel);
    }
    output
}

fn convolve_pixel(
    image: &ArrayView2<f64>,
    kernel: &ArrayView2<f64>,
    i: usize,
    j: usize,
    edge_mode: EdgeMode,
) -> f64 {
    let (rows, cols) = image.dim();
    let (krows, kcols) = kernel.dim();
    let (kr, kc) = ((krows / 2) as isize, (kcols / 2) as isize);
    let mut sum = 0.0;
    for ((ki, kj), weight) in kernel.indexed_iter() {
        if *weight == 0.0 {
            continue;
        }
        // Kernel flipped: true convolution rather than correlation
        let ii = i as isize + kr - ki as isize;
        let jj = j as isize + kc - kj as isize;
        sum += weight * get_pixel(image, ii, jj, rows, cols, edge_mode);
    }
    sum
}

fn get_pixel(
    image: &ArrayView2<f64>,
    i: isize,
    j: isize,
    rows: usize,
    cols: usize,
    edge_mode: EdgeMode,
) -> f64 {
    let (rows, cols) = (rows as isize, cols as isize);
    if i >= 0 && i < rows && j >= 0 && j < cols {
        return image[[i as usize, j as usize]];
    }
    let (i, j) = match edge_mode {
        EdgeMode::Constant(value) => return value,
        EdgeMode::Reflect => (reflect_index(i, rows), reflect_index(j, cols)),
        EdgeMode::Wrap => (i.rem_euclid(rows), j.rem_euclid(cols)),
        EdgeMode::Extend => (i.clamp(0, rows - 1), j.clamp(0, cols - 1)),
    };
    image[[i as usize, j as usize]]
}

fn reflect_index(idx: isize, size: isize) -> isize {
    let idx = if idx < 0 {
        -idx - 1
    } else if idx >= size {
        2 * size - idx - 1
    } else {
        idx
    };
    idx.clamp(0, size - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_delta_kernel_is_identity() {
        let image = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let kernel = array![[0.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 0.0]];
        let out = convolve2d(image.view(), kernel.view(), ConvolveOptions::default());
        assert_eq!(out, image);
    }

    #[test]
    fn test_kernel_is_flipped() {
        let mut image = Array2::zeros((5, 5));
        image[[2, 2]] = 1.0;
        let kernel = array![[0.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 0.0, 0.0]];
        let out = convolve2d(
            image.view(),
            kernel.view(),
            ConvolveOptions {
                parallel: false,
                edge_mode: EdgeMode::Constant(0.0),
            },
        );
        // A point convolved with a kernel reproduces the kernel around it
        assert_eq!(out[[2, 3]], 1.0);
        assert_eq!(out.sum(), 1.0);
    }

    #[test]
    fn test_flux_conserved_away_from_edges() {
        let mut image = Array2::zeros((9, 9));
        image[[4, 4]] = 10.0;
        let kernel = Array2::from_elem((3, 3), 1.0 / 9.0);
        let out = convolve2d(image.view(), kernel.view(), ConvolveOptions::default());
        assert_relative_eq!(out.sum(), 10.0, epsilon = 1e-12);
    }

    #[test]
    fn test_edge_modes() {
        let image = array![[1.0, 2.0], [3.0, 4.0]];
        let kernel = array![[0.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 0.0, 0.0]];
        let run = |edge_mode| {
            convolve2d(
                image.view(),
                kernel.view(),
                ConvolveOptions {
                    parallel: false,
                    edge_mode,
                },
            )
        };
        // Output (i, j) reads input (i, j - 1)
        assert_eq!(run(EdgeMode::Constant(-1.0))[[0, 0]], -1.0);
        assert_eq!(run(EdgeMode::Extend)[[0, 0]], 1.0);
        assert_eq!(run(EdgeMode::Wrap)[[0, 0]], 2.0);
        assert_eq!(run(EdgeMode::Reflect)[[1, 0]], 3.0);
    }
}
