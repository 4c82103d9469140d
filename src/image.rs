/*!
`get_image_width`, `get_image_channel_data_type` and
`get_image_channel_order` on 1D image buffers.

A kernel reads the queries and the `CLK_*` constants of the expected format
into a small struct, which is checked on the host.
*/
use crate::{harness::DataGen, result::Result};
use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Which image widths to test.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageSizeMode {
    /// Widths 1 to 12.
    Small,
    /// Widths at the device limits.
    Max,
    /// Random widths, see [`random_size`].
    Random,
}

impl FromStr for ImageSizeMode {
    type Err = ();
    fn from_str(input: &str) -> Result<Self, ()> {
        match input {
            "small" => Ok(Self::Small),
            "max" => Ok(Self::Max),
            "random" => Ok(Self::Random),
            _ => Err(()),
        }
    }
}

macro_rules! cl_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $raw:literal => $cl:literal,)+ }) => {
        $(#[$meta])*
        #[allow(non_camel_case_types)]
        #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
        #[repr(u32)]
        pub enum $name {
            $($variant = $raw,)+
        }

        impl $name {
            pub fn iter() -> impl Iterator<Item = Self> {
                [$(Self::$variant),+].into_iter()
            }
            /// The OpenCL enum value.
            #[inline]
            pub fn raw(&self) -> u32 {
                *self as u32
            }
            pub fn from_raw(raw: u32) -> Option<Self> {
                Self::iter().find(|x| x.raw() == raw)
            }
            /// The name of the host constant, ie "CL_RGBA".
            pub fn name(&self) -> &'static str {
                match self {
                    $(Self::$variant => $cl,)+
                }
            }
            /// The name of the kernel constant, ie "CLK_RGBA".
            pub fn kernel_constant(&self) -> String {
                format!("CLK_{}", &self.name()[3..])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}

cl_enum! {
    /// Image channel orders.
    ChannelOrder {
        R = 0x10B0 => "CL_R",
        A = 0x10B1 => "CL_A",
        RG = 0x10B2 => "CL_RG",
        RA = 0x10B3 => "CL_RA",
        RGB = 0x10B4 => "CL_RGB",
        RGBA = 0x10B5 => "CL_RGBA",
        BGRA = 0x10B6 => "CL_BGRA",
        ARGB = 0x10B7 => "CL_ARGB",
        INTENSITY = 0x10B8 => "CL_INTENSITY",
        LUMINANCE = 0x10B9 => "CL_LUMINANCE",
        Rx = 0x10BA => "CL_Rx",
        RGx = 0x10BB => "CL_RGx",
        RGBx = 0x10BC => "CL_RGBx",
        DEPTH = 0x10BD => "CL_DEPTH",
        DEPTH_STENCIL = 0x10BE => "CL_DEPTH_STENCIL",
        sRGB = 0x10BF => "CL_sRGB",
        sRGBx = 0x10C0 => "CL_sRGBx",
        sRGBA = 0x10C1 => "CL_sRGBA",
        sBGRA = 0x10C2 => "CL_sBGRA",
        ABGR = 0x10C3 => "CL_ABGR",
    }
}

cl_enum! {
    /// Image channel data types.
    ChannelType {
        SNORM_INT8 = 0x10D0 => "CL_SNORM_INT8",
        SNORM_INT16 = 0x10D1 => "CL_SNORM_INT16",
        UNORM_INT8 = 0x10D2 => "CL_UNORM_INT8",
        UNORM_INT16 = 0x10D3 => "CL_UNORM_INT16",
        UNORM_SHORT_565 = 0x10D4 => "CL_UNORM_SHORT_565",
        UNORM_SHORT_555 = 0x10D5 => "CL_UNORM_SHORT_555",
        UNORM_INT_101010 = 0x10D6 => "CL_UNORM_INT_101010",
        SIGNED_INT8 = 0x10D7 => "CL_SIGNED_INT8",
        SIGNED_INT16 = 0x10D8 => "CL_SIGNED_INT16",
        SIGNED_INT32 = 0x10D9 => "CL_SIGNED_INT32",
        UNSIGNED_INT8 = 0x10DA => "CL_UNSIGNED_INT8",
        UNSIGNED_INT16 = 0x10DB => "CL_UNSIGNED_INT16",
        UNSIGNED_INT32 = 0x10DC => "CL_UNSIGNED_INT32",
        HALF_FLOAT = 0x10DD => "CL_HALF_FLOAT",
        FLOAT = 0x10DE => "CL_FLOAT",
        UNORM_INT24 = 0x10DF => "CL_UNORM_INT24",
        UNORM_INT_101010_2 = 0x10E0 => "CL_UNORM_INT_101010_2",
    }
}

impl ChannelOrder {
    pub fn channels(&self) -> usize {
        use ChannelOrder::*;
        match self {
            R | A | INTENSITY | LUMINANCE | DEPTH | DEPTH_STENCIL => 1,
            RG | RA | Rx => 2,
            RGB | RGx | sRGB => 3,
            RGBA | BGRA | ARGB | RGBx | sRGBx | sRGBA | sBGRA | ABGR => 4,
        }
    }
}

impl ChannelType {
    /// Bytes per channel, or per pixel for packed types.
    fn size(&self) -> usize {
        use ChannelType::*;
        match self {
            SNORM_INT8 | UNORM_INT8 | SIGNED_INT8 | UNSIGNED_INT8 => 1,
            SNORM_INT16 | UNORM_INT16 | SIGNED_INT16 | UNSIGNED_INT16 | HALF_FLOAT => 2,
            SIGNED_INT32 | UNSIGNED_INT32 | FLOAT | UNORM_INT24 => 4,
            UNORM_SHORT_565 | UNORM_SHORT_555 => 2,
            UNORM_INT_101010 | UNORM_INT_101010_2 => 4,
        }
    }
    fn is_packed(&self) -> bool {
        use ChannelType::*;
        matches!(
            self,
            UNORM_SHORT_565 | UNORM_SHORT_555 | UNORM_INT_101010 | UNORM_INT_101010_2
        )
    }
}

/// An image format.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ImageFormat {
    pub order: ChannelOrder,
    pub data_type: ChannelType,
}

impl ImageFormat {
    pub fn new(order: ChannelOrder, data_type: ChannelType) -> Self {
        Self { order, data_type }
    }
    /// Size of a pixel in bytes.
    pub fn pixel_size(&self) -> usize {
        if self.data_type.is_packed() {
            self.data_type.size()
        } else {
            self.order.channels() * self.data_type.size()
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}, {})", self.order, self.data_type)
    }
}

/// Memory limits that bound image sizes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ImageLimits {
    /// Max width of a 1D image buffer, in pixels.
    pub max_width: usize,
    pub max_alloc: u64,
    pub global_mem: u64,
}

impl ImageLimits {
    pub fn new(max_width: usize, max_alloc: u64, global_mem: u64) -> Self {
        // allocations can't exceed the address space
        if global_mem > usize::MAX as u64 {
            Self {
                max_width,
                max_alloc: usize::MAX as u64,
                global_mem: usize::MAX as u64,
            }
        } else {
            Self {
                max_width,
                max_alloc,
                global_mem,
            }
        }
    }
    fn fits(&self, row_pitch: usize) -> bool {
        let size = row_pitch as u64 * 4;
        size <= self.max_alloc && size * 3 <= self.global_mem
    }
}

/// Width in pixels and the size of the backing buffer in bytes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ImageSize {
    pub width: usize,
    pub row_pitch: usize,
}

pub fn small_sizes(pixel_size: usize) -> Vec<ImageSize> {
    (1..13)
        .map(|width| ImageSize {
            width,
            row_pitch: width * pixel_size,
        })
        .collect()
}

/// The largest widths the device supports, and half of it.
pub fn max_sizes(pixel_size: usize, limits: &ImageLimits) -> Vec<ImageSize> {
    let max = (limits.max_width as u64)
        .min(limits.max_alloc / pixel_size as u64)
        .min(limits.global_mem / 4 / pixel_size as u64) as usize;
    let mut widths = vec![max, max / 2];
    widths.dedup();
    widths
        .into_iter()
        .filter(|&width| width > 0)
        .map(|width| ImageSize {
            width,
            row_pitch: width * pixel_size,
        })
        .collect()
}

/// Number of random sizes tested.
pub const RANDOM_ITERATIONS: usize = 4;
const MAX_ATTEMPTS: usize = 1000;

/// A random width in `16..=max_width / 32`, with a padded row pitch that is a
/// multiple of the pixel size.
///
/// Sizes are drawn until 4 row pitches fit in one allocation and 12 fit in
/// global memory. Returns None if no size fits.
pub fn random_size(gen: &mut DataGen, pixel_size: usize, limits: &ImageLimits) -> Option<ImageSize> {
    for _ in 0..MAX_ATTEMPTS {
        let width = gen.log_in_range(16, limits.max_width / 32);
        let mut extra = gen.log_in_range(0, 64);
        let mut row_pitch = width * pixel_size + extra;
        // growing padding only reaches every residue for powers of two
        for _ in 0..2 * pixel_size {
            extra += 1;
            row_pitch += extra;
            if row_pitch % pixel_size == 0 {
                break;
            }
        }
        row_pitch = (row_pitch + pixel_size - 1) / pixel_size * pixel_size;
        if limits.fits(row_pitch) {
            return Some(ImageSize { width, row_pitch });
        }
    }
    None
}

/// The sizes to test for `mode`.
pub fn image_sizes(
    mode: ImageSizeMode,
    gen: &mut DataGen,
    pixel_size: usize,
    limits: &ImageLimits,
) -> Vec<ImageSize> {
    match mode {
        ImageSizeMode::Small => small_sizes(pixel_size),
        ImageSizeMode::Max => max_sizes(pixel_size, limits),
        ImageSizeMode::Random => (0..RANDOM_ITERATIONS)
            .filter_map(|_| random_size(gen, pixel_size, limits))
            .collect(),
    }
}

/// Written by the kernel.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
pub struct ImageInfoData {
    pub width: i32,
    pub channel_type: i32,
    pub channel_order: i32,
    pub expected_channel_type: i32,
    pub expected_channel_order: i32,
}

/// Generates `sample_kernel`, `read_only` or `write_only` per `read_only`.
pub fn image_info_kernel_source(format: &ImageFormat, read_only: bool) -> String {
    let access = if read_only { "read_only" } else { "write_only" };
    let expected_type = format.data_type.kernel_constant();
    let expected_order = format.order.kernel_constant();
    format!(
        r#"typedef struct {{
    int width;
    int channel_type;
    int channel_order;
    int expected_channel_type;
    int expected_channel_order;
}} image_info_t;

__kernel void sample_kernel({access} image1d_buffer_t input, __global image_info_t* out) {{
    out->width = get_image_width(input);
    out->channel_type = get_image_channel_data_type(input);
    out->channel_order = get_image_channel_order(input);
    out->expected_channel_type = {expected_type};
    out->expected_channel_order = {expected_order};
}}
"#
    )
}

/// Checks the kernel output, returns a message per error.
pub fn verify_image_info(format: &ImageFormat, width: usize, data: &ImageInfoData) -> Vec<String> {
    let mut errors = Vec::new();
    if data.width as i64 != width as i64 {
        errors.push(format!(
            "ERROR: Returned width did not validate (expected {width}, got {})",
            data.width
        ));
    }
    if data.channel_type != data.expected_channel_type {
        errors.push(format!(
            "ERROR: Returned channel type did not validate (expected {} ({}), got {})",
            format.data_type, data.expected_channel_type, data.channel_type
        ));
    }
    if data.channel_order != data.expected_channel_order {
        errors.push(format!(
            "ERROR: Returned channel order did not validate (expected {} ({}), got {})",
            format.order, data.expected_channel_order, data.channel_order
        ));
    }
    errors
}

/// Checks size selection against the limits for every format.
pub fn self_check() -> Result<()> {
    use anyhow::ensure;

    let limits = ImageLimits::new(65536, 1 << 26, 1 << 28);
    let mut gen = DataGen::new(0);
    for order in ChannelOrder::iter() {
        for data_type in ChannelType::iter() {
            let format = ImageFormat::new(order, data_type);
            let pixel = format.pixel_size();
            for mode in [ImageSizeMode::Small, ImageSizeMode::Max, ImageSizeMode::Random] {
                let sizes = image_sizes(mode, &mut gen, pixel, &limits);
                ensure!(!sizes.is_empty(), "no {mode:?} sizes for {format}");
                for size in sizes {
                    ensure!(size.width <= limits.max_width, "{size:?} {format}");
                    ensure!(size.row_pitch % pixel == 0, "{size:?} {format}");
                    ensure!(size.row_pitch >= size.width * pixel, "{size:?} {format}");
                }
            }
            let src = image_info_kernel_source(&format, true);
            ensure!(src.contains(&format.order.kernel_constant()));
        }
    }
    Ok(())
}

#[cfg(feature = "device")]
pub use device::run_1d_buffer_info;

#[cfg(feature = "device")]
mod device {
    use super::*;
    use crate::harness::{TestContext, TestOutcome};
    use anyhow::Context as _;
    use ocl::{
        core::ImageFormat as ClImageFormat,
        enums::MemObjectType,
        flags::MemFlags,
        Buffer, Image,
    };
    use tracing::{debug, error, info};

    fn to_format(format: &ClImageFormat) -> Option<ImageFormat> {
        Some(ImageFormat::new(
            ChannelOrder::from_raw(format.channel_order as u32)?,
            ChannelType::from_raw(format.channel_data_type as u32)?,
        ))
    }

    pub fn run_1d_buffer_info(ctx: &TestContext) -> Result<TestOutcome> {
        if !ctx.image_support()? {
            info!("Device does not support images. Skipping test.");
            return Ok(TestOutcome::Skip);
        }
        let limits = ImageLimits::new(
            ctx.image_max_buffer_size()?,
            ctx.max_mem_alloc_size()?,
            ctx.global_mem_size()?,
        );
        let mut outcome = TestOutcome::Skip;
        for flags in [MemFlags::READ_ONLY, MemFlags::WRITE_ONLY] {
            let formats =
                Image::<u8>::supported_formats(ctx.context(), flags, MemObjectType::Image1dBuffer)
                    .context("Unable to get supported image formats")?;
            for cl_format in formats.into_iter().filter_map(|x| x.ok()) {
                let format = match to_format(&cl_format) {
                    Some(format) => format,
                    None => {
                        debug!("unknown image format {cl_format:?}");
                        continue;
                    }
                };
                info!("Testing {format}");
                let read_only = flags == MemFlags::READ_ONLY;
                let result = test_format(ctx, &cl_format, &format, flags, read_only, &limits);
                outcome = outcome.combine(result.with_context(|| format!("{format}"))?);
            }
        }
        Ok(outcome)
    }

    fn test_format(
        ctx: &TestContext,
        cl_format: &ClImageFormat,
        format: &ImageFormat,
        flags: MemFlags,
        read_only: bool,
        limits: &ImageLimits,
    ) -> Result<TestOutcome> {
        let mut gen = ctx.data_gen();
        let sizes = image_sizes(ctx.config().image_sizes, &mut gen, format.pixel_size(), limits);
        if sizes.is_empty() {
            info!("No image size fits the device limits. Skipping {format}.");
            return Ok(TestOutcome::Skip);
        }
        let program = ctx.build_program(&image_info_kernel_source(format, read_only))?;
        let queue = ctx.queue();
        for size in sizes {
            debug!(" - Creating 1D image {} (row pitch {})", size.width, size.row_pitch);
            let data = gen.bytes(size.row_pitch);
            let buffer = Buffer::<u8>::builder()
                .queue(queue.clone())
                .flags(flags)
                .len(size.row_pitch)
                .copy_host_slice(&data)
                .build()
                .with_context(|| {
                    format!("Unable to create buffer for 1D image buffer of size {}", size.row_pitch)
                })?;
            let image = Image::<u8>::builder()
                .channel_order(cl_format.channel_order)
                .channel_data_type(cl_format.channel_data_type)
                .image_type(MemObjectType::Image1dBuffer)
                .dims(size.width)
                .flags(flags)
                .buffer_sync(buffer.as_core().clone())
                .queue(queue.clone())
                .build()
                .with_context(|| format!("Unable to create 1D image of size {}", size.width))?;
            let out = Buffer::<i32>::builder()
                .queue(queue.clone())
                .len(5)
                .build()
                .context("Unable to create output buffer")?;
            let kernel = ctx
                .kernel_builder(&program, "sample_kernel")
                .global_work_size(1)
                .local_work_size(1)
                .arg(&image)
                .arg(&out)
                .build()?;
            unsafe {
                kernel.enq().context("Unable to run kernel")?;
            }
            let mut words = [0i32; 5];
            out.read(&mut words[..]).enq().context("Unable to read data buffer")?;
            queue.finish()?;
            let data: ImageInfoData = bytemuck::cast(words);
            let errors = verify_image_info(format, size.width, &data);
            if !errors.is_empty() {
                for e in errors {
                    error!("{e}");
                }
                return Ok(TestOutcome::Fail);
            }
        }
        Ok(TestOutcome::Pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_mode_parse() {
        assert_eq!("small".parse(), Ok(ImageSizeMode::Small));
        assert_eq!("max".parse(), Ok(ImageSizeMode::Max));
        assert_eq!("random".parse(), Ok(ImageSizeMode::Random));
        assert_eq!("Small".parse::<ImageSizeMode>(), Err(()));
    }

    #[test]
    fn kernel_constants() {
        assert_eq!(ChannelOrder::RGBA.kernel_constant(), "CLK_RGBA");
        assert_eq!(ChannelOrder::sBGRA.kernel_constant(), "CLK_sBGRA");
        assert_eq!(ChannelType::UNORM_INT_101010_2.kernel_constant(), "CLK_UNORM_INT_101010_2");
        assert_eq!(ChannelType::from_raw(0x10DD), Some(ChannelType::HALF_FLOAT));
        assert_eq!(ChannelOrder::from_raw(0x10C3), Some(ChannelOrder::ABGR));
        assert_eq!(ChannelOrder::from_raw(0x1000), None);
    }

    #[test]
    fn pixel_sizes() {
        use {ChannelOrder as O, ChannelType as T};
        assert_eq!(ImageFormat::new(O::RGBA, T::UNORM_INT8).pixel_size(), 4);
        assert_eq!(ImageFormat::new(O::RGBA, T::FLOAT).pixel_size(), 16);
        assert_eq!(ImageFormat::new(O::RG, T::HALF_FLOAT).pixel_size(), 4);
        assert_eq!(ImageFormat::new(O::R, T::UNSIGNED_INT16).pixel_size(), 2);
        assert_eq!(ImageFormat::new(O::RGB, T::UNORM_SHORT_565).pixel_size(), 2);
        assert_eq!(ImageFormat::new(O::RGB, T::UNORM_INT_101010).pixel_size(), 4);
    }

    #[test]
    fn small_sizes_are_unpadded() {
        let sizes = small_sizes(4);
        assert_eq!(sizes.len(), 12);
        assert_eq!(sizes[0], ImageSize { width: 1, row_pitch: 4 });
        assert_eq!(sizes[11], ImageSize { width: 12, row_pitch: 48 });
    }

    #[test]
    fn max_sizes_respect_memory() {
        let limits = ImageLimits::new(1 << 27, 1 << 20, 1 << 30);
        assert_eq!(
            max_sizes(4, &limits),
            [
                ImageSize { width: 1 << 18, row_pitch: 1 << 20 },
                ImageSize { width: 1 << 17, row_pitch: 1 << 19 },
            ]
        );
        let limits = ImageLimits::new(1, 1 << 20, 1 << 30);
        assert_eq!(max_sizes(16, &limits), [ImageSize { width: 1, row_pitch: 16 }]);
    }

    #[test]
    fn random_sizes_fit() {
        let limits = ImageLimits::new(1 << 16, 1 << 24, 1 << 26);
        let mut gen = DataGen::new(11);
        for pixel in [1, 2, 3, 4, 6, 8, 16] {
            for _ in 0..100 {
                let size = random_size(&mut gen, pixel, &limits).unwrap();
                assert!((16..=(1 << 16) / 32).contains(&size.width), "{size:?}");
                assert_eq!(size.row_pitch % pixel, 0);
                assert!(size.row_pitch > size.width * pixel);
                assert!(limits.fits(size.row_pitch));
            }
        }
    }

    #[test]
    fn random_sizes_exhausted() {
        let limits = ImageLimits::new(1 << 16, 64, 1 << 26);
        assert_eq!(random_size(&mut DataGen::new(0), 4, &limits), None);
    }

    #[test]
    fn kernel_source_access() {
        let format = ImageFormat::new(ChannelOrder::R, ChannelType::FLOAT);
        let src = image_info_kernel_source(&format, false);
        assert!(src.contains("sample_kernel(write_only image1d_buffer_t input"));
        assert!(src.contains("out->expected_channel_type = CLK_FLOAT;"));
        assert!(src.contains("out->expected_channel_order = CLK_R;"));
        assert!(image_info_kernel_source(&format, true).contains("(read_only image1d_buffer_t"));
    }

    #[test]
    fn verify_info() {
        let format = ImageFormat::new(ChannelOrder::RGBA, ChannelType::UNORM_INT8);
        let mut data = ImageInfoData {
            width: 100,
            channel_type: 0x10D2,
            channel_order: 0x10B5,
            expected_channel_type: 0x10D2,
            expected_channel_order: 0x10B5,
        };
        assert!(verify_image_info(&format, 100, &data).is_empty());
        data.width = 99;
        data.channel_order = 0x10B6;
        let errors = verify_image_info(&format, 100, &data);
        assert_eq!(errors.len(), 2);
        assert_eq!(
            errors[1],
            "ERROR: Returned channel order did not validate (expected CL_RGBA (4277), got 4278)"
        );
    }

    #[test]
    fn host_self_check() {
        self_check().unwrap();
    }
}
