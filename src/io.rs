// ============================================================================
// STACK I/O: multi-page TIFF hyperstacks and single-plane images
// ============================================================================
//
// TIFF stacks keep their dimensions in an ImageJ-style `ImageDescription`
// on the first page (`images=`, `channels=`, `slices=`, `frames=`). Files
// without one load as a plain Z stack. Other formats go through `image` and
// always yield a single plane.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageBuffer, Luma};
use rfd::FileDialog;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::{TiffEncoder, colortype};
use tiff::tags::Tag;

use crate::stack::{ImageStack, PixelFormat, PlaneData, StackDims, StackError};
use crate::{log_info, log_warn};

#[derive(Debug)]
pub enum StackIoError {
    Io(std::io::Error),
    Tiff(tiff::TiffError),
    Image(image::ImageError),
    Stack(StackError),
    Unsupported(String),
}

impl fmt::Display for StackIoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackIoError::Io(e) => write!(f, "I/O error: {}", e),
            StackIoError::Tiff(e) => write!(f, "TIFF error: {}", e),
            StackIoError::Image(e) => write!(f, "Image error: {}", e),
            StackIoError::Stack(e) => write!(f, "Invalid stack: {}", e),
            StackIoError::Unsupported(msg) => write!(f, "Unsupported: {}", msg),
        }
    }
}

impl std::error::Error for StackIoError {}

impl From<std::io::Error> for StackIoError {
    fn from(e: std::io::Error) -> Self {
        StackIoError::Io(e)
    }
}

impl From<tiff::TiffError> for StackIoError {
    fn from(e: tiff::TiffError) -> Self {
        StackIoError::Tiff(e)
    }
}

impl From<image::ImageError> for StackIoError {
    fn from(e: image::ImageError) -> Self {
        StackIoError::Image(e)
    }
}

impl From<StackError> for StackIoError {
    fn from(e: StackError) -> Self {
        StackIoError::Stack(e)
    }
}

/// Extensions offered in the open dialog.
pub const STACK_EXTENSIONS: &[&str] = &["tif", "tiff", "png", "bmp", "pgm", "tga"];

pub fn is_tiff(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref(),
        Some("tif" | "tiff")
    )
}

// ============================================================================
// Hyperstack description
// ============================================================================

/// C/Z/T layout recorded in a TIFF description.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HyperstackLayout {
    pub channels: usize,
    pub slices: usize,
    pub frames: usize,
}

/// Read the layout from an ImageJ description. Keys that are missing default
/// to 1; a layout that does not account for every page is rejected so the
/// caller can fall back to a plain Z stack.
pub fn parse_description(description: &str, pages: usize) -> Option<HyperstackLayout> {
    if !description.starts_with("ImageJ=") {
        return None;
    }
    let mut layout = HyperstackLayout { channels: 1, slices: 1, frames: 1 };
    let mut images = None;
    for line in description.lines() {
        let Some((key, val)) = line.split_once('=') else { continue };
        let Ok(n) = val.trim().parse::<usize>() else { continue };
        match key.trim() {
            "images" => images = Some(n),
            "channels" => layout.channels = n,
            "slices" => layout.slices = n,
            "frames" => layout.frames = n,
            _ => {}
        }
    }
    // ImageJ omits slices for a plain stack and relies on images=
    if layout.count()? == 1
        && let Some(n) = images
    {
        layout.slices = n;
    }
    let count = layout.count()?;
    (count == pages && count > 0).then_some(layout)
}

impl HyperstackLayout {
    /// `None` when the declared dimensions overflow.
    fn count(&self) -> Option<usize> {
        self.channels.checked_mul(self.slices)?.checked_mul(self.frames)
    }
}

/// Description written on the first page of a saved stack.
pub fn format_description(dims: &StackDims) -> String {
    let mut desc = format!("ImageJ=1.54f\nimages={}\n", dims.plane_count());
    if dims.channels > 1 {
        desc.push_str(&format!("channels={}\n", dims.channels));
    }
    if dims.slices > 1 {
        desc.push_str(&format!("slices={}\n", dims.slices));
    }
    if dims.frames > 1 {
        desc.push_str(&format!("frames={}\n", dims.frames));
    }
    if dims.channels > 1 || dims.frames > 1 {
        desc.push_str("hyperstack=true\nmode=grayscale\n");
    }
    desc.push_str("loop=false\n");
    desc
}

// ============================================================================
// Loading
// ============================================================================

/// Load a stack from disk, choosing the decoder from the file extension.
pub fn load_stack(path: &Path) -> Result<ImageStack, StackIoError> {
    let stack = if is_tiff(path) { load_tiff(path)? } else { load_single(path)? };
    log_info!("Loaded {} ({})", path.display(), stack.describe());
    Ok(stack)
}

fn load_tiff(path: &Path) -> Result<ImageStack, StackIoError> {
    let reader = BufReader::new(File::open(path)?);
    let mut decoder = Decoder::new(reader)?.with_limits(Limits::unlimited());

    let (width, height) = decoder.dimensions()?;
    let description = decoder.get_tag_ascii_string(Tag::ImageDescription).ok();

    let mut planes = Vec::new();
    loop {
        let dims = decoder.dimensions()?;
        if dims != (width, height) {
            return Err(StackIoError::Unsupported(format!(
                "page {} is {}x{}, first page is {}x{}",
                planes.len() + 1,
                dims.0,
                dims.1,
                width,
                height
            )));
        }
        match decoder.colortype()? {
            tiff::ColorType::Gray(_) => {}
            other => {
                return Err(StackIoError::Unsupported(format!(
                    "page {} has color type {:?}; only grayscale stacks can be denoised",
                    planes.len() + 1,
                    other
                )));
            }
        }
        let plane = match decoder.read_image()? {
            DecodingResult::U8(v) => PlaneData::Gray8(v),
            DecodingResult::U16(v) => PlaneData::Gray16(v),
            DecodingResult::F32(v) => PlaneData::Gray32(v),
            _ => {
                return Err(StackIoError::Unsupported(format!(
                    "page {} sample format (8/16-bit integer or 32-bit float expected)",
                    planes.len() + 1
                )));
            }
        };
        planes.push(plane);
        if !decoder.more_images() {
            break;
        }
        decoder.next_image()?;
    }

    let pages = planes.len();
    let layout = match description.as_deref() {
        Some(desc) => parse_description(desc, pages).unwrap_or_else(|| {
            if desc.starts_with("ImageJ=") {
                log_warn!("Hyperstack description does not match {} pages; loading as Z stack", pages);
            }
            HyperstackLayout { channels: 1, slices: pages, frames: 1 }
        }),
        None => HyperstackLayout { channels: 1, slices: pages, frames: 1 },
    };
    let dims = StackDims {
        width: width as usize,
        height: height as usize,
        channels: layout.channels,
        slices: layout.slices,
        frames: layout.frames,
    };
    Ok(ImageStack::new(dims, planes)?)
}

fn load_single(path: &Path) -> Result<ImageStack, StackIoError> {
    let img = image::open(path)?;
    let (width, height) = (img.width() as usize, img.height() as usize);
    let plane = match img {
        DynamicImage::ImageLuma8(buf) => PlaneData::Gray8(buf.into_raw()),
        DynamicImage::ImageLuma16(buf) => PlaneData::Gray16(buf.into_raw()),
        other => {
            log_warn!("{} is not grayscale; converting to luminance", path.display());
            if other.color().bytes_per_pixel() / other.color().channel_count() > 1 {
                PlaneData::Gray16(other.to_luma16().into_raw())
            } else {
                PlaneData::Gray8(other.to_luma8().into_raw())
            }
        }
    };
    Ok(ImageStack::single(width, height, plane)?)
}

// ============================================================================
// Saving
// ============================================================================

/// Write a stack at its native bit depth. Non-TIFF targets accept only
/// single-plane 8/16-bit stacks.
pub fn save_stack(stack: &ImageStack, path: &Path) -> Result<(), StackIoError> {
    if is_tiff(path) {
        save_tiff(stack, path)?;
    } else {
        save_single(stack, path)?;
    }
    log_info!("Saved {} ({})", path.display(), stack.describe());
    Ok(())
}

fn save_tiff(stack: &ImageStack, path: &Path) -> Result<(), StackIoError> {
    let writer = BufWriter::new(File::create(path)?);
    let mut encoder = TiffEncoder::new(writer)?;
    let (w, h) = (stack.width() as u32, stack.height() as u32);
    let description = format_description(&stack.dims());

    for (i, plane) in stack.planes().iter().enumerate() {
        let first = i == 0;
        match plane {
            PlaneData::Gray8(p) => {
                let mut img = encoder.new_image::<colortype::Gray8>(w, h)?;
                if first {
                    img.encoder().write_tag(Tag::ImageDescription, description.as_str())?;
                }
                img.write_data(p)?;
            }
            PlaneData::Gray16(p) => {
                let mut img = encoder.new_image::<colortype::Gray16>(w, h)?;
                if first {
                    img.encoder().write_tag(Tag::ImageDescription, description.as_str())?;
                }
                img.write_data(p)?;
            }
            PlaneData::Gray32(p) => {
                let mut img = encoder.new_image::<colortype::Gray32Float>(w, h)?;
                if first {
                    img.encoder().write_tag(Tag::ImageDescription, description.as_str())?;
                }
                img.write_data(p)?;
            }
        }
    }
    Ok(())
}

fn save_single(stack: &ImageStack, path: &Path) -> Result<(), StackIoError> {
    if stack.len() != 1 {
        return Err(StackIoError::Unsupported(format!(
            "{} planes cannot be written to {}; save as .tif",
            stack.len(),
            path.display()
        )));
    }
    let (w, h) = (stack.width() as u32, stack.height() as u32);
    let plane = stack.plane(1)?;
    let too_small = || StackIoError::Unsupported("plane buffer does not match dimensions".into());
    match plane {
        PlaneData::Gray8(p) => {
            let buf = ImageBuffer::<Luma<u8>, _>::from_raw(w, h, p.clone()).ok_or_else(too_small)?;
            buf.save(path)?;
        }
        PlaneData::Gray16(p) => {
            let buf = ImageBuffer::<Luma<u16>, _>::from_raw(w, h, p.clone()).ok_or_else(too_small)?;
            buf.save(path)?;
        }
        PlaneData::Gray32(_) => {
            return Err(StackIoError::Unsupported(format!(
                "{} data can only be saved as .tif",
                PixelFormat::Gray32.label()
            )));
        }
    }
    Ok(())
}

/// Default output path: `<stem>_denoised.<ext>` next to the input.
pub fn denoised_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "stack".to_string());
    let ext = input
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "tif".to_string());
    input.with_file_name(format!("{}_denoised.{}", stem, ext))
}

// ============================================================================
// Native dialogs
// ============================================================================

pub fn pick_stack_path() -> Option<PathBuf> {
    FileDialog::new()
        .add_filter("Image stacks", STACK_EXTENSIONS)
        .add_filter("All Files", &["*"])
        .pick_file()
}

pub fn pick_save_path(suggested: &Path) -> Option<PathBuf> {
    let mut dialog = FileDialog::new().add_filter("TIFF stack", &["tif", "tiff"]);
    if let Some(name) = suggested.file_name() {
        dialog = dialog.set_file_name(name.to_string_lossy());
    }
    if let Some(dir) = suggested.parent().filter(|d| d.is_dir()) {
        dialog = dialog.set_directory(dir);
    }
    dialog.save_file()
}

pub fn pick_model_path() -> Option<PathBuf> {
    FileDialog::new()
        .add_filter("ONNX model", &["onnx"])
        .pick_file()
}

pub fn pick_runtime_path() -> Option<PathBuf> {
    let exts: &[&str] = if cfg!(windows) {
        &["dll"]
    } else if cfg!(target_os = "macos") {
        &["dylib"]
    } else {
        &["so", "*"]
    };
    FileDialog::new()
        .add_filter("ONNX Runtime library", exts)
        .pick_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("nia_io_{}_{}", uuid::Uuid::new_v4(), name))
    }

    #[test]
    fn parses_hyperstack_description() {
        let desc = "ImageJ=1.54f\nimages=24\nchannels=2\nslices=3\nframes=4\nhyperstack=true\n";
        assert_eq!(
            parse_description(desc, 24),
            Some(HyperstackLayout { channels: 2, slices: 3, frames: 4 })
        );
        assert_eq!(parse_description(desc, 23), None);
        assert_eq!(
            parse_description("ImageJ=1.54f\nimages=7\n", 7),
            Some(HyperstackLayout { channels: 1, slices: 7, frames: 1 })
        );
        assert_eq!(parse_description("made by a scanner", 3), None);
    }

    #[test]
    fn overflowing_description_is_ignored() {
        // channels × slices wraps to 2 in modular arithmetic
        let channels = usize::MAX / 2 + 2;
        let desc = format!("ImageJ=1.54f\nimages=2\nchannels={}\nslices=2\n", channels);
        assert_eq!(parse_description(&desc, 2), None);
        let desc = format!("ImageJ=1.54f\nchannels={}\nslices=2\nframes=2\n", channels);
        assert_eq!(parse_description(&desc, 4), None);
    }

    #[test]
    fn tiff_with_overflowing_description_loads_as_z_stack() {
        let path = scratch("hostile.tif");
        let desc = format!("ImageJ=1.54f\nimages=2\nchannels={}\nslices=2\n", usize::MAX / 2 + 2);
        {
            let mut encoder = TiffEncoder::new(BufWriter::new(File::create(&path).unwrap())).unwrap();
            for i in 0..2u8 {
                let mut img = encoder.new_image::<colortype::Gray8>(2, 1).unwrap();
                if i == 0 {
                    img.encoder().write_tag(Tag::ImageDescription, desc.as_str()).unwrap();
                }
                img.write_data(&[i, i + 10]).unwrap();
            }
        }
        let stack = load_stack(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        let dims = stack.dims();
        assert_eq!((dims.channels, dims.slices, dims.frames), (1, 2, 1));
        assert_eq!(stack.plane(2).unwrap(), &PlaneData::Gray8(vec![1, 11]));
    }

    #[test]
    fn description_round_trips_layout() {
        let dims = StackDims { width: 4, height: 4, channels: 2, slices: 1, frames: 3 };
        let desc = format_description(&dims);
        assert_eq!(
            parse_description(&desc, 6),
            Some(HyperstackLayout { channels: 2, slices: 1, frames: 3 })
        );
    }

    #[test]
    fn tiff_hyperstack_survives_save_and_load() {
        let dims = StackDims { width: 3, height: 2, channels: 2, slices: 2, frames: 1 };
        let planes = (0..4u16)
            .map(|i| PlaneData::Gray16((0..6).map(|p| i * 1000 + p).collect()))
            .collect();
        let stack = ImageStack::new(dims, planes).unwrap();
        let path = scratch("stack.tif");
        save_stack(&stack, &path).unwrap();
        let back = load_stack(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(back, stack);
    }

    #[test]
    fn float_tiff_round_trips() {
        let stack = ImageStack::single(2, 1, PlaneData::Gray32(vec![0.25, 1234.5])).unwrap();
        let path = scratch("float.tiff");
        save_stack(&stack, &path).unwrap();
        let back = load_stack(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(back, stack);
    }

    #[test]
    fn png_holds_one_integer_plane() {
        let stack = ImageStack::single(2, 2, PlaneData::Gray8(vec![0, 64, 128, 255])).unwrap();
        let path = scratch("plane.png");
        save_stack(&stack, &path).unwrap();
        let back = load_stack(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(back, stack);

        let float = ImageStack::single(1, 1, PlaneData::Gray32(vec![1.0])).unwrap();
        assert!(matches!(
            save_stack(&float, &scratch("f.png")),
            Err(StackIoError::Unsupported(_))
        ));
    }

    #[test]
    fn denoised_path_keeps_extension() {
        assert_eq!(
            denoised_path(Path::new("/data/cells.tif")),
            PathBuf::from("/data/cells_denoised.tif")
        );
    }
}
