// ============================================================================
// IMAGE STACK: multi-dimensional plane container (channel / slice / frame)
// ============================================================================
//
// Planes are stored in hyperstack order: channels vary fastest, then slices,
// then frames. Coordinates are 1-based, matching the convention used by the
// ImageJ hyperstack description written into TIFF files.

use std::fmt;

/// Native pixel format of every plane in a stack. Fixed for the whole stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Gray8,
    Gray16,
    Gray32,
}

impl PixelFormat {
    pub fn bit_depth(&self) -> u8 {
        match self {
            PixelFormat::Gray8 => 8,
            PixelFormat::Gray16 => 16,
            PixelFormat::Gray32 => 32,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PixelFormat::Gray8 => "8-bit",
            PixelFormat::Gray16 => "16-bit",
            PixelFormat::Gray32 => "32-bit float",
        }
    }
}

/// Pixel buffer of one plane, row-major.
#[derive(Clone, Debug, PartialEq)]
pub enum PlaneData {
    Gray8(Vec<u8>),
    Gray16(Vec<u16>),
    Gray32(Vec<f32>),
}

impl PlaneData {
    pub fn format(&self) -> PixelFormat {
        match self {
            PlaneData::Gray8(_) => PixelFormat::Gray8,
            PlaneData::Gray16(_) => PixelFormat::Gray16,
            PlaneData::Gray32(_) => PixelFormat::Gray32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            PlaneData::Gray8(p) => p.len(),
            PlaneData::Gray16(p) => p.len(),
            PlaneData::Gray32(p) => p.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lossless widening to `f32`. No rescaling is applied.
    pub fn to_f32(&self) -> Vec<f32> {
        match self {
            PlaneData::Gray8(p) => p.iter().map(|&v| v as f32).collect(),
            PlaneData::Gray16(p) => p.iter().map(|&v| v as f32).collect(),
            PlaneData::Gray32(p) => p.clone(),
        }
    }

    /// Largest finite value in the plane, or `None` if there is none.
    pub fn max_value(&self) -> Option<f64> {
        match self {
            PlaneData::Gray8(p) => p.iter().max().map(|&v| v as f64),
            PlaneData::Gray16(p) => p.iter().max().map(|&v| v as f64),
            PlaneData::Gray32(p) => p
                .iter()
                .filter(|v| v.is_finite())
                .fold(None, |acc: Option<f32>, &v| Some(acc.map_or(v, |m| m.max(v))))
                .map(|v| v as f64),
        }
    }

    /// Convert a float buffer to the given native format.
    ///
    /// Integer formats round to the nearest value and clamp to the type range;
    /// NaN maps to 0. Float planes are written through unchanged.
    pub fn from_f32(format: PixelFormat, values: &[f32]) -> PlaneData {
        match format {
            PixelFormat::Gray8 => {
                PlaneData::Gray8(values.iter().map(|&v| round_clamp(v, 255.0) as u8).collect())
            }
            PixelFormat::Gray16 => PlaneData::Gray16(
                values.iter().map(|&v| round_clamp(v, 65535.0) as u16).collect(),
            ),
            PixelFormat::Gray32 => PlaneData::Gray32(values.to_vec()),
        }
    }
}

#[inline]
fn round_clamp(v: f32, max: f32) -> f32 {
    if v.is_nan() {
        return 0.0;
    }
    v.round().clamp(0.0, max)
}

/// A single-channel float plane produced by inference.
#[derive(Clone, Debug, PartialEq)]
pub struct FloatPlane {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f32>,
}

/// One (channel, slice, frame) coordinate, all 1-based.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StackCoord {
    pub channel: usize,
    pub slice: usize,
    pub frame: usize,
}

impl fmt::Display for StackCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{} z{} t{}", self.channel, self.slice, self.frame)
    }
}

/// Hyperstack dimensions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackDims {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
    pub slices: usize,
    pub frames: usize,
}

impl StackDims {
    /// `C × Z × T`, or `None` when it does not fit in `usize`.
    pub fn checked_plane_count(&self) -> Option<usize> {
        self.channels.checked_mul(self.slices)?.checked_mul(self.frames)
    }

    /// Saturates; exact for any dims an [`ImageStack`] accepted.
    pub fn plane_count(&self) -> usize {
        self.checked_plane_count().unwrap_or(usize::MAX)
    }

    pub fn plane_len(&self) -> usize {
        self.width.saturating_mul(self.height)
    }
}

/// Errors raised when constructing or mutating a stack.
#[derive(Debug, Clone, PartialEq)]
pub enum StackError {
    EmptyDimension(&'static str),
    PlaneCount { expected: usize, found: usize },
    PlaneSize { index: usize, expected: usize, found: usize },
    MixedFormat { index: usize, expected: PixelFormat, found: PixelFormat },
    IndexOutOfRange(usize),
    TooManyPlanes { channels: usize, slices: usize, frames: usize },
}

impl fmt::Display for StackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackError::EmptyDimension(name) => write!(f, "stack dimension '{}' is zero", name),
            StackError::PlaneCount { expected, found } => {
                write!(f, "expected {} planes, found {}", expected, found)
            }
            StackError::PlaneSize { index, expected, found } => write!(
                f,
                "plane {} has {} pixels, expected {}",
                index, found, expected
            ),
            StackError::MixedFormat { index, expected, found } => write!(
                f,
                "plane {} is {}, stack is {}",
                index,
                found.label(),
                expected.label()
            ),
            StackError::IndexOutOfRange(i) => write!(f, "stack index {} out of range", i),
            StackError::TooManyPlanes { channels, slices, frames } => write!(
                f,
                "{} channels × {} slices × {} frames overflows the plane count",
                channels, slices, frames
            ),
        }
    }
}

impl std::error::Error for StackError {}

/// Ordered collection of same-sized, same-format planes.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageStack {
    dims: StackDims,
    format: PixelFormat,
    planes: Vec<PlaneData>,
}

impl ImageStack {
    /// Build a stack from planes in hyperstack order (channel fastest).
    pub fn new(dims: StackDims, planes: Vec<PlaneData>) -> Result<Self, StackError> {
        for (name, v) in [
            ("width", dims.width),
            ("height", dims.height),
            ("channels", dims.channels),
            ("slices", dims.slices),
            ("frames", dims.frames),
        ] {
            if v == 0 {
                return Err(StackError::EmptyDimension(name));
            }
        }
        let expected = dims.checked_plane_count().ok_or(StackError::TooManyPlanes {
            channels: dims.channels,
            slices: dims.slices,
            frames: dims.frames,
        })?;
        if planes.len() != expected {
            return Err(StackError::PlaneCount { expected, found: planes.len() });
        }
        let format = planes[0].format();
        for (i, p) in planes.iter().enumerate() {
            if p.format() != format {
                return Err(StackError::MixedFormat {
                    index: i + 1,
                    expected: format,
                    found: p.format(),
                });
            }
            if p.len() != dims.plane_len() {
                return Err(StackError::PlaneSize {
                    index: i + 1,
                    expected: dims.plane_len(),
                    found: p.len(),
                });
            }
        }
        Ok(Self { dims, format, planes })
    }

    /// A single plane wrapped as a 1×1×1 stack.
    pub fn single(width: usize, height: usize, plane: PlaneData) -> Result<Self, StackError> {
        Self::new(
            StackDims { width, height, channels: 1, slices: 1, frames: 1 },
            vec![plane],
        )
    }

    pub fn dims(&self) -> StackDims {
        self.dims
    }

    pub fn width(&self) -> usize {
        self.dims.width
    }

    pub fn height(&self) -> usize {
        self.dims.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn len(&self) -> usize {
        self.planes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.planes.is_empty()
    }

    pub fn planes(&self) -> &[PlaneData] {
        &self.planes
    }

    /// 1-based linear index of a 1-based (c, z, t) coordinate.
    pub fn stack_index(&self, coord: StackCoord) -> usize {
        let d = &self.dims;
        (coord.frame - 1) * d.channels * d.slices + (coord.slice - 1) * d.channels + coord.channel
    }

    /// Plane at a 1-based linear index.
    pub fn plane(&self, index: usize) -> Result<&PlaneData, StackError> {
        index
            .checked_sub(1)
            .and_then(|i| self.planes.get(i))
            .ok_or(StackError::IndexOutOfRange(index))
    }

    /// Replace the plane at a 1-based linear index. Format and size must match.
    pub fn set_plane(&mut self, index: usize, plane: PlaneData) -> Result<(), StackError> {
        if plane.format() != self.format {
            return Err(StackError::MixedFormat {
                index,
                expected: self.format,
                found: plane.format(),
            });
        }
        if plane.len() != self.dims.plane_len() {
            return Err(StackError::PlaneSize {
                index,
                expected: self.dims.plane_len(),
                found: plane.len(),
            });
        }
        let slot = index
            .checked_sub(1)
            .and_then(|i| self.planes.get_mut(i))
            .ok_or(StackError::IndexOutOfRange(index))?;
        *slot = plane;
        Ok(())
    }

    /// Every coordinate in canonical order: frames outer, slices middle,
    /// channels inner.
    pub fn coords(&self) -> impl Iterator<Item = StackCoord> + use<> {
        let StackDims { channels, slices, frames, .. } = self.dims;
        (1..=frames).flat_map(move |frame| {
            (1..=slices).flat_map(move |slice| {
                (1..=channels).map(move |channel| StackCoord { channel, slice, frame })
            })
        })
    }

    /// `Size: WxH | C1 Z3 T1`: shown in the GUI image info panel.
    pub fn describe(&self) -> String {
        let d = &self.dims;
        format!(
            "Size: {}x{} | C{} Z{} T{} | {}",
            d.width,
            d.height,
            d.channels,
            d.slices,
            d.frames,
            self.format.label()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims(c: usize, z: usize, t: usize) -> StackDims {
        StackDims { width: 2, height: 1, channels: c, slices: z, frames: t }
    }

    fn gray8_planes(n: usize) -> Vec<PlaneData> {
        (0..n).map(|i| PlaneData::Gray8(vec![i as u8; 2])).collect()
    }

    #[test]
    fn canonical_order_visits_every_index_once_in_sequence() {
        let stack = ImageStack::new(dims(2, 3, 2), gray8_planes(12)).unwrap();
        let indices: Vec<usize> = stack.coords().map(|c| stack.stack_index(c)).collect();
        assert_eq!(indices, (1..=12).collect::<Vec<_>>());

        let first: Vec<StackCoord> = stack.coords().take(3).collect();
        assert_eq!(first[0], StackCoord { channel: 1, slice: 1, frame: 1 });
        assert_eq!(first[1], StackCoord { channel: 2, slice: 1, frame: 1 });
        assert_eq!(first[2], StackCoord { channel: 1, slice: 2, frame: 1 });
    }

    #[test]
    fn rejects_mismatched_planes() {
        assert_eq!(
            ImageStack::new(dims(1, 2, 1), gray8_planes(3)).unwrap_err(),
            StackError::PlaneCount { expected: 2, found: 3 }
        );
        let planes = vec![PlaneData::Gray8(vec![0; 2]), PlaneData::Gray16(vec![0; 2])];
        assert!(matches!(
            ImageStack::new(dims(1, 2, 1), planes),
            Err(StackError::MixedFormat { index: 2, .. })
        ));
        let planes = vec![PlaneData::Gray8(vec![0; 3])];
        assert!(matches!(
            ImageStack::new(dims(1, 1, 1), planes),
            Err(StackError::PlaneSize { .. })
        ));
        assert_eq!(
            ImageStack::new(dims(0, 1, 1), vec![]).unwrap_err(),
            StackError::EmptyDimension("channels")
        );
    }

    #[test]
    fn overflowing_dimensions_are_rejected() {
        let channels = usize::MAX / 2 + 2;
        let huge = dims(channels, 2, 1);
        assert_eq!(huge.checked_plane_count(), None);
        assert_eq!(huge.plane_count(), usize::MAX);
        assert_eq!(
            ImageStack::new(huge, gray8_planes(2)).unwrap_err(),
            StackError::TooManyPlanes { channels, slices: 2, frames: 1 }
        );
    }

    #[test]
    fn integer_conversion_rounds_and_clamps() {
        let values = [-3.0, 0.4, 0.5, 254.6, 300.0, f32::NAN];
        assert_eq!(
            PlaneData::from_f32(PixelFormat::Gray8, &values),
            PlaneData::Gray8(vec![0, 0, 1, 255, 255, 0])
        );
        let values = [999.6, 70000.0];
        assert_eq!(
            PlaneData::from_f32(PixelFormat::Gray16, &values),
            PlaneData::Gray16(vec![1000, 65535])
        );
        let values = [1.0e6, 0.25];
        assert_eq!(
            PlaneData::from_f32(PixelFormat::Gray32, &values),
            PlaneData::Gray32(vec![1.0e6, 0.25])
        );
    }

    #[test]
    fn set_plane_checks_format_and_bounds() {
        let mut stack = ImageStack::new(dims(1, 2, 1), gray8_planes(2)).unwrap();
        stack.set_plane(2, PlaneData::Gray8(vec![9, 9])).unwrap();
        assert_eq!(stack.plane(2).unwrap(), &PlaneData::Gray8(vec![9, 9]));
        assert!(stack.set_plane(3, PlaneData::Gray8(vec![0, 0])).is_err());
        assert!(stack.set_plane(0, PlaneData::Gray8(vec![0, 0])).is_err());
        assert!(stack.set_plane(1, PlaneData::Gray32(vec![0.0, 0.0])).is_err());
    }

    #[test]
    fn float_max_ignores_nan() {
        let p = PlaneData::Gray32(vec![f32::NAN, 2.5, -1.0]);
        assert_eq!(p.max_value(), Some(2.5));
        assert_eq!(PlaneData::Gray32(vec![f32::NAN]).max_value(), None);
    }
}
