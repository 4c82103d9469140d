/*!
Importing Android hardware buffers with `cl_khr_external_memory_android_hardware_buffer`.

Hardware buffers can only be allocated on Android. On other targets the device
tests report [`TestOutcome::Skip`](crate::harness::TestOutcome::Skip).
*/
use crate::{
    image::{ChannelOrder, ChannelType, ImageFormat},
    result::Result,
};
use std::{fmt, ops::BitOr};

pub const EXTENSION: &str = "cl_khr_external_memory_android_hardware_buffer";

/// `CL_EXTERNAL_MEMORY_HANDLE_AHB_KHR`
pub const EXTERNAL_MEMORY_HANDLE_AHB: u64 = 0x2070;

pub mod error {
    use thiserror::Error;

    #[derive(Clone, Copy, Debug, Error)]
    #[error("AHardwareBuffer_allocate failed with code {code}")]
    pub struct AllocationFailed {
        pub code: i32,
    }
}

/// `AHardwareBuffer_Format` values used by the tests.
#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u32)]
pub enum HardwareBufferFormat {
    R8G8B8A8_UNORM = 1,
    R16G16B16A16_FLOAT = 0x16,
    BLOB = 0x21,
    R8_UNORM = 0x38,
    R16_UINT = 0x39,
    R16G16_UINT = 0x3a,
}

impl HardwareBufferFormat {
    #[inline]
    pub fn raw(&self) -> u32 {
        *self as u32
    }
    pub fn name(&self) -> &'static str {
        use HardwareBufferFormat::*;
        match self {
            R8G8B8A8_UNORM => "AHARDWAREBUFFER_FORMAT_R8G8B8A8_UNORM",
            R16G16B16A16_FLOAT => "AHARDWAREBUFFER_FORMAT_R16G16B16A16_FLOAT",
            BLOB => "AHARDWAREBUFFER_FORMAT_BLOB",
            R8_UNORM => "AHARDWAREBUFFER_FORMAT_R8_UNORM",
            R16_UINT => "AHARDWAREBUFFER_FORMAT_R16_UINT",
            R16G16_UINT => "AHARDWAREBUFFER_FORMAT_R16G16_UINT",
        }
    }
    /// Bytes per pixel, 1 for blobs.
    pub fn pixel_size(&self) -> usize {
        use HardwareBufferFormat::*;
        match self {
            BLOB | R8_UNORM => 1,
            R16_UINT => 2,
            R8G8B8A8_UNORM | R16G16_UINT => 4,
            R16G16B16A16_FLOAT => 8,
        }
    }
}

impl fmt::Display for HardwareBufferFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// `AHardwareBuffer_UsageFlags`
#[derive(Clone, Copy, Default, Debug, Eq, PartialEq, Hash)]
pub struct UsageFlags(pub u64);

impl UsageFlags {
    pub const CPU_READ_OFTEN: Self = Self(3);
    pub const CPU_WRITE_OFTEN: Self = Self(0x30);
    pub const GPU_SAMPLED_IMAGE: Self = Self(0x100);
    pub const GPU_FRAMEBUFFER: Self = Self(0x200);
    pub const GPU_DATA_BUFFER: Self = Self(0x100_0000);

    const NAMES: [(Self, &'static str); 5] = [
        (Self::CPU_READ_OFTEN, "CPU_READ_OFTEN"),
        (Self::CPU_WRITE_OFTEN, "CPU_WRITE_OFTEN"),
        (Self::GPU_SAMPLED_IMAGE, "GPU_SAMPLED_IMAGE"),
        (Self::GPU_FRAMEBUFFER, "GPU_FRAMEBUFFER"),
        (Self::GPU_DATA_BUFFER, "GPU_DATA_BUFFER"),
    ];

    #[inline]
    pub fn bits(&self) -> u64 {
        self.0
    }
    #[inline]
    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for UsageFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Names joined by "|", unknown bits in hex.
impl fmt::Display for UsageFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut rest = self.0;
        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                rest &= !flag.0;
                first = false;
            }
        }
        if rest != 0 || first {
            if !first {
                f.write_str("|")?;
            }
            write!(f, "{rest:#x}")?;
        }
        Ok(())
    }
}

/// A hardware buffer format and the image format it imports as.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FormatMapping {
    pub format: HardwareBufferFormat,
    pub image_format: ImageFormat,
}

const fn mapping(
    format: HardwareBufferFormat,
    order: ChannelOrder,
    data_type: ChannelType,
) -> FormatMapping {
    FormatMapping {
        format,
        image_format: ImageFormat { order, data_type },
    }
}

/// Imported as 2D images.
pub const IMAGE_FORMATS: [FormatMapping; 5] = [
    mapping(
        HardwareBufferFormat::R16G16B16A16_FLOAT,
        ChannelOrder::RGBA,
        ChannelType::HALF_FLOAT,
    ),
    mapping(
        HardwareBufferFormat::R16G16_UINT,
        ChannelOrder::RG,
        ChannelType::UNSIGNED_INT16,
    ),
    mapping(
        HardwareBufferFormat::R16_UINT,
        ChannelOrder::R,
        ChannelType::UNSIGNED_INT16,
    ),
    mapping(
        HardwareBufferFormat::R8G8B8A8_UNORM,
        ChannelOrder::RGBA,
        ChannelType::UNORM_INT8,
    ),
    mapping(
        HardwareBufferFormat::R8_UNORM,
        ChannelOrder::R,
        ChannelType::UNORM_INT8,
    ),
];

pub const IMAGE_USAGES: [UsageFlags; 3] = [
    UsageFlags(
        UsageFlags::CPU_READ_OFTEN.0
            | UsageFlags::CPU_WRITE_OFTEN.0
            | UsageFlags::GPU_SAMPLED_IMAGE.0
            | UsageFlags::GPU_FRAMEBUFFER.0,
    ),
    UsageFlags::GPU_SAMPLED_IMAGE,
    UsageFlags::GPU_FRAMEBUFFER,
];

/// (width, height)
pub const TEST_SIZES: [(u32, u32); 1] = [(128, 128)];

/// Describes a hardware buffer to allocate.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BufferDesc {
    pub format: HardwareBufferFormat,
    pub usage: UsageFlags,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
}

impl fmt::Display for BufferDesc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:\n   Usage flags {}\n   Size ({}, {}, layers = {})",
            self.format, self.usage, self.width, self.height, self.layers
        )
    }
}

/// Every format, usage and size of the images test.
pub fn image_cases() -> impl Iterator<Item = (FormatMapping, BufferDesc)> {
    IMAGE_FORMATS.into_iter().flat_map(|mapping| {
        IMAGE_USAGES.into_iter().flat_map(move |usage| {
            TEST_SIZES.into_iter().map(move |(width, height)| {
                let desc = BufferDesc {
                    format: mapping.format,
                    usage,
                    width,
                    height,
                    layers: 1,
                };
                (mapping, desc)
            })
        })
    })
}

/// One blob per test size, with as many bytes as the image has pixels.
pub fn blob_cases() -> impl Iterator<Item = BufferDesc> {
    TEST_SIZES.into_iter().map(|(width, height)| BufferDesc {
        format: HardwareBufferFormat::BLOB,
        usage: UsageFlags::GPU_DATA_BUFFER,
        width: width * height,
        height: 1,
        layers: 1,
    })
}

/// Compares the raw format of an imported image to `expected`.
pub fn verify_imported_format(
    expected: &ImageFormat,
    channel_order: u32,
    channel_data_type: u32,
) -> Option<String> {
    if channel_order != expected.order.raw() {
        return Some(format!(
            "Expected channel order {}, got {channel_order}",
            expected.order.raw()
        ));
    }
    if channel_data_type != expected.data_type.raw() {
        return Some(format!(
            "Expected image_channel_data_type {}, got {channel_data_type}",
            expected.data_type.raw()
        ));
    }
    None
}

/// Checks the format tables and the expected image formats.
pub fn self_check() -> Result<()> {
    use anyhow::ensure;

    for (mapping, desc) in image_cases() {
        let format = &mapping.image_format;
        ensure!(
            format.pixel_size() == mapping.format.pixel_size(),
            "{} imports as {format} with a different pixel size",
            mapping.format
        );
        ensure!(desc.layers == 1 && desc.width > 0 && desc.height > 0);
        ensure!(verify_imported_format(format, format.order.raw(), format.data_type.raw()).is_none());
    }
    for desc in blob_cases() {
        ensure!(desc.height == 1 && desc.usage == UsageFlags::GPU_DATA_BUFFER);
    }
    Ok(())
}

#[cfg(feature = "device")]
pub use device::{run_blob, run_images};

#[cfg(all(feature = "device", not(target_os = "android")))]
mod device {
    use super::*;
    use crate::harness::{TestContext, TestOutcome};
    use tracing::info;

    fn unavailable(ctx: &TestContext) -> Result<TestOutcome> {
        if !ctx.has_extension(EXTENSION)? {
            info!("{EXTENSION} is not supported on this platform. Skipping test.");
        } else {
            info!("Hardware buffers are only available on Android. Skipping test.");
        }
        Ok(TestOutcome::Skip)
    }

    pub fn run_images(ctx: &TestContext) -> Result<TestOutcome> {
        unavailable(ctx)
    }

    pub fn run_blob(ctx: &TestContext) -> Result<TestOutcome> {
        unavailable(ctx)
    }
}

#[cfg(all(feature = "device", target_os = "android"))]
mod device {
    use super::{error::AllocationFailed, *};
    use crate::harness::{TestContext, TestOutcome};
    use anyhow::bail;
    use ocl::core::ffi::{
        cl_context, cl_image_desc, cl_image_format, cl_int, cl_mem, cl_mem_flags,
        clGetImageInfo, clReleaseMemObject, CL_IMAGE_FORMAT, CL_MEM_READ_WRITE, CL_SUCCESS,
    };
    use std::{
        ffi::c_void,
        mem::{size_of, MaybeUninit},
        ptr::{self, NonNull},
    };
    use tracing::{error, info};

    #[allow(non_camel_case_types)]
    type cl_mem_properties = u64;

    #[link(name = "OpenCL")]
    extern "system" {
        fn clCreateImageWithProperties(
            context: cl_context,
            properties: *const cl_mem_properties,
            flags: cl_mem_flags,
            image_format: *const cl_image_format,
            image_desc: *const cl_image_desc,
            host_ptr: *mut c_void,
            errcode_ret: *mut cl_int,
        ) -> cl_mem;
        fn clCreateBufferWithProperties(
            context: cl_context,
            properties: *const cl_mem_properties,
            flags: cl_mem_flags,
            size: usize,
            host_ptr: *mut c_void,
            errcode_ret: *mut cl_int,
        ) -> cl_mem;
    }

    struct HardwareBuffer(NonNull<ndk_sys::AHardwareBuffer>);

    impl HardwareBuffer {
        fn ffi_desc(desc: &BufferDesc) -> ndk_sys::AHardwareBuffer_Desc {
            ndk_sys::AHardwareBuffer_Desc {
                width: desc.width,
                height: desc.height,
                layers: desc.layers,
                format: desc.format.raw(),
                usage: desc.usage.bits(),
                stride: 0,
                rfu0: 0,
                rfu1: 0,
            }
        }
        fn is_supported(desc: &BufferDesc) -> bool {
            let desc = Self::ffi_desc(desc);
            unsafe { ndk_sys::AHardwareBuffer_isSupported(&desc) != 0 }
        }
        fn allocate(desc: &BufferDesc) -> Result<Self, AllocationFailed> {
            let desc = Self::ffi_desc(desc);
            let mut buffer = ptr::null_mut();
            let code = unsafe { ndk_sys::AHardwareBuffer_allocate(&desc, &mut buffer) };
            match NonNull::new(buffer) {
                Some(buffer) if code == 0 => Ok(Self(buffer)),
                _ => Err(AllocationFailed { code }),
            }
        }
        /// The import properties, terminated with 0.
        fn properties(&self) -> [cl_mem_properties; 3] {
            [EXTERNAL_MEMORY_HANDLE_AHB, self.0.as_ptr() as cl_mem_properties, 0]
        }
    }

    impl Drop for HardwareBuffer {
        fn drop(&mut self) {
            unsafe {
                ndk_sys::AHardwareBuffer_release(self.0.as_ptr());
            }
        }
    }

    struct MemObject(cl_mem);

    impl MemObject {
        fn new(mem: cl_mem, code: cl_int, what: &str) -> Result<Self> {
            if code != CL_SUCCESS as cl_int || mem.is_null() {
                bail!("Failed to create CL {what} from AHardwareBuffer (error {code})");
            }
            Ok(Self(mem))
        }
        fn image_format(&self) -> Result<cl_image_format> {
            let mut format = MaybeUninit::<cl_image_format>::zeroed();
            let code = unsafe {
                clGetImageInfo(
                    self.0,
                    CL_IMAGE_FORMAT,
                    size_of::<cl_image_format>(),
                    format.as_mut_ptr() as *mut c_void,
                    ptr::null_mut(),
                )
            };
            if code != CL_SUCCESS as cl_int {
                bail!("Failed to query image format (error {code})");
            }
            Ok(unsafe { format.assume_init() })
        }
    }

    impl Drop for MemObject {
        fn drop(&mut self) {
            unsafe {
                clReleaseMemObject(self.0);
            }
        }
    }

    fn raw_context(ctx: &TestContext) -> cl_context {
        ctx.context().as_core().as_ptr()
    }

    pub fn run_images(ctx: &TestContext) -> Result<TestOutcome> {
        if !ctx.has_extension(EXTENSION)? {
            info!("{EXTENSION} is not supported on this platform. Skipping test.");
            return Ok(TestOutcome::Skip);
        }
        for (mapping, desc) in image_cases() {
            if !HardwareBuffer::is_supported(&desc) {
                info!("Unsupported format {desc}");
                continue;
            }
            let buffer = match HardwareBuffer::allocate(&desc) {
                Ok(buffer) => buffer,
                Err(e) => {
                    error!("{e}");
                    return Ok(TestOutcome::Fail);
                }
            };
            info!("Testing {}", desc.format);
            let properties = buffer.properties();
            let mut code = 0;
            let image = unsafe {
                clCreateImageWithProperties(
                    raw_context(ctx),
                    properties.as_ptr(),
                    CL_MEM_READ_WRITE,
                    ptr::null(),
                    ptr::null(),
                    ptr::null_mut(),
                    &mut code,
                )
            };
            let image = MemObject::new(image, code, "image")?;
            let format = image.image_format()?;
            if let Some(e) = verify_imported_format(
                &mapping.image_format,
                format.image_channel_order,
                format.image_channel_data_type,
            ) {
                error!("{e}");
                return Ok(TestOutcome::Fail);
            }
            // release the image before the hardware buffer
            drop(image);
        }
        Ok(TestOutcome::Pass)
    }

    pub fn run_blob(ctx: &TestContext) -> Result<TestOutcome> {
        if !ctx.has_extension(EXTENSION)? {
            info!("{EXTENSION} is not supported on this platform. Skipping test.");
            return Ok(TestOutcome::Skip);
        }
        for desc in blob_cases() {
            if !HardwareBuffer::is_supported(&desc) {
                info!("Unsupported format {}, usage flags {}", desc.format, desc.usage);
                continue;
            }
            let buffer = match HardwareBuffer::allocate(&desc) {
                Ok(buffer) => buffer,
                Err(e) => {
                    error!("{e}");
                    return Ok(TestOutcome::Fail);
                }
            };
            info!("Testing {}", desc.format);
            let properties = buffer.properties();
            let mut code = 0;
            let mem = unsafe {
                clCreateBufferWithProperties(
                    raw_context(ctx),
                    properties.as_ptr(),
                    CL_MEM_READ_WRITE,
                    0,
                    ptr::null_mut(),
                    &mut code,
                )
            };
            drop(MemObject::new(mem, code, "buffer")?);
        }
        Ok(TestOutcome::Pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_display() {
        assert_eq!(
            (UsageFlags::CPU_READ_OFTEN | UsageFlags::GPU_FRAMEBUFFER).to_string(),
            "CPU_READ_OFTEN|GPU_FRAMEBUFFER"
        );
        assert_eq!(
            IMAGE_USAGES[0].to_string(),
            "CPU_READ_OFTEN|CPU_WRITE_OFTEN|GPU_SAMPLED_IMAGE|GPU_FRAMEBUFFER"
        );
        assert_eq!(
            (UsageFlags::GPU_DATA_BUFFER | UsageFlags(0x4000_0000)).to_string(),
            "GPU_DATA_BUFFER|0x40000000"
        );
        assert_eq!(UsageFlags::default().to_string(), "0x0");
    }

    #[test]
    fn format_names() {
        assert_eq!(
            HardwareBufferFormat::R16G16B16A16_FLOAT.name(),
            "AHARDWAREBUFFER_FORMAT_R16G16B16A16_FLOAT"
        );
        assert_eq!(HardwareBufferFormat::BLOB.raw(), 0x21);
        assert_eq!(HardwareBufferFormat::R8_UNORM.raw(), 0x38);
    }

    #[test]
    fn image_case_count() {
        let cases: Vec<_> = image_cases().collect();
        assert_eq!(cases.len(), IMAGE_FORMATS.len() * IMAGE_USAGES.len() * TEST_SIZES.len());
        let (mapping, desc) = cases[4];
        assert_eq!(mapping.format, HardwareBufferFormat::R16G16_UINT);
        assert_eq!(desc.usage, UsageFlags::GPU_SAMPLED_IMAGE);
        assert_eq!((desc.width, desc.height, desc.layers), (128, 128, 1));
    }

    #[test]
    fn blob_is_one_row() {
        let blobs: Vec<_> = blob_cases().collect();
        assert_eq!(
            blobs,
            [BufferDesc {
                format: HardwareBufferFormat::BLOB,
                usage: UsageFlags::GPU_DATA_BUFFER,
                width: 128 * 128,
                height: 1,
                layers: 1,
            }]
        );
    }

    #[test]
    fn desc_display() {
        let (_, desc) = image_cases().nth(2).unwrap();
        assert_eq!(
            desc.to_string(),
            "AHARDWAREBUFFER_FORMAT_R16G16B16A16_FLOAT:\n   Usage flags GPU_FRAMEBUFFER\n   Size (128, 128, layers = 1)"
        );
    }

    #[test]
    fn imported_format_mismatch() {
        let expected = IMAGE_FORMATS[0].image_format;
        assert_eq!(verify_imported_format(&expected, 0x10B5, 0x10DD), None);
        assert_eq!(
            verify_imported_format(&expected, 0x10B6, 0x10DD).as_deref(),
            Some("Expected channel order 4277, got 4278")
        );
        assert_eq!(
            verify_imported_format(&expected, 0x10B5, 0x10DE).as_deref(),
            Some("Expected image_channel_data_type 4317, got 4318")
        );
    }

    #[test]
    fn host_self_check() {
        self_check().unwrap();
    }
}
