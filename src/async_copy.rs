/*!
3D strided copies between global and local memory with
`async_work_group_copy_3D3D` (`cl_khr_extended_async_copies`).

Each work group copies a run of planes. A plane is [`LINES`] lines of
[`ELEMENTS_PER_LINE`] elements, and lines and planes are separated by margins
on both the source and the destination side. The copy must write every element
to its strided position and must leave the destination margins untouched.

Strides and margins are in elements. An element is an opaque struct of
`elem_size` bytes.
*/
use crate::{harness::DataGen, result::Result};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Write as _};

/// The device extension providing `async_work_group_copy_3D3D`.
pub const EXTENSION: &str = "cl_khr_extended_async_copies";
pub const ELEMENTS_PER_LINE: usize = 10;
pub const LINES: usize = 13;
pub const PLANES_PER_WORK_ITEM: usize = 2;
pub const MAX_WORK_GROUPS: usize = 1111;
/// Element sizes in bytes.
pub const ELEM_SIZES: [usize; 13] = [1, 2, 3, 4, 5, 6, 7, 8, 13, 16, 32, 47, 64];
/// Margins are `multiplier * elem_size` elements.
pub const MARGIN_MULTIPLIERS: [usize; 3] = [0, 10, 100];
/// Reporting stops once more than this many mismatches are found.
pub const MAX_REPORTED: usize = 5;

/// Which side of the copy is local memory.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CopyDirection {
    GlobalToLocal,
    LocalToGlobal,
}

impl CopyDirection {
    #[inline]
    pub fn local_is_dst(&self) -> bool {
        *self == CopyDirection::GlobalToLocal
    }
}

/// Element size and margins of one copy.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Copy3dParams {
    pub elem_size: usize,
    pub src_line_margin: usize,
    pub dst_line_margin: usize,
    pub src_plane_margin: usize,
    pub dst_plane_margin: usize,
}

impl Copy3dParams {
    /// Every combination of margin multipliers for `elem_size`.
    pub fn sweep(elem_size: usize) -> impl Iterator<Item = Self> {
        let m = MARGIN_MULTIPLIERS;
        m.into_iter().flat_map(move |src_line| {
            m.into_iter().flat_map(move |dst_line| {
                m.into_iter().flat_map(move |src_plane| {
                    m.into_iter().map(move |dst_plane| Self {
                        elem_size,
                        src_line_margin: src_line * elem_size,
                        dst_line_margin: dst_line * elem_size,
                        src_plane_margin: src_plane * elem_size,
                        dst_plane_margin: dst_plane * elem_size,
                    })
                })
            })
        })
    }
}

impl Display for Copy3dParams {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} byte element with srcLineMargin = {}, dstLineMargin = {}, srcPlaneMargin = {}, dstPlaneMargin = {}",
            self.elem_size,
            self.src_line_margin,
            self.dst_line_margin,
            self.src_plane_margin,
            self.dst_plane_margin
        )
    }
}

/// Device limits that bound the size of a copy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DeviceLimits {
    pub local_mem_size: u64,
    pub global_mem_size: u64,
    pub max_alloc_size: u64,
    pub max_work_item_size0: usize,
    pub max_work_group_size: usize,
    /// Work group size limit of the compiled kernel.
    pub kernel_work_group_size: usize,
}

/// Why a copy can not be run on a device.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum LayoutSkip {
    #[error("Skipping due to resource requirements local:{local_buffer_bytes}b  max_work_group_size:{max_work_group_size}")]
    LocalBufferTooLarge {
        local_buffer_bytes: usize,
        max_work_group_size: usize,
    },
    #[error("Skipping, not enough memory for a single work group")]
    NoWorkGroups,
}

/// Sizes of a copy, derived from [`Copy3dParams`] and [`DeviceLimits`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Copy3dLayout {
    pub params: Copy3dParams,
    pub direction: CopyDirection,
    pub src_line_stride: usize,
    pub dst_line_stride: usize,
    pub src_plane_stride: usize,
    pub dst_plane_stride: usize,
    /// Work items per work group.
    pub local_size: usize,
    pub work_groups: usize,
    pub local_buffer_bytes: usize,
    pub total_planes: usize,
    pub in_bytes: usize,
    pub out_bytes: usize,
}

impl Copy3dLayout {
    pub fn new(
        params: Copy3dParams,
        direction: CopyDirection,
        limits: &DeviceLimits,
    ) -> Result<Self, LayoutSkip> {
        let elem = params.elem_size;
        let max_alloc = limits.max_alloc_size.min(limits.global_mem_size / 2) as usize;
        let max_group = limits
            .kernel_work_group_size
            .min(limits.max_work_item_size0);

        let src_line_stride = ELEMENTS_PER_LINE + params.src_line_margin;
        let dst_line_stride = ELEMENTS_PER_LINE + params.dst_line_margin;
        let src_plane_stride = LINES * src_line_stride + params.src_plane_margin;
        let dst_plane_stride = LINES * dst_line_stride + params.dst_plane_margin;

        let (local_plane_stride, local_plane_margin) = if direction.local_is_dst() {
            (dst_plane_stride, params.dst_plane_margin)
        } else {
            (src_plane_stride, params.src_plane_margin)
        };
        let local_bytes_per_item = elem * PLANES_PER_WORK_ITEM * local_plane_stride;
        // embedded devices may only have 1KB of local memory
        let local_size = ((limits.local_mem_size / 2) as usize / local_bytes_per_item)
            .max(1)
            .min(max_group);

        let max_planes_in = (max_alloc / elem + params.src_plane_margin) / src_plane_stride;
        let max_planes_out = (max_alloc / elem + params.dst_plane_margin) / dst_plane_stride;
        let max_planes = max_planes_in.min(max_planes_out);
        let work_groups = (max_planes / (local_size * PLANES_PER_WORK_ITEM)).min(MAX_WORK_GROUPS);

        let local_buffer_bytes = local_size * local_bytes_per_item - local_plane_margin;
        if local_buffer_bytes / 4 > limits.max_work_group_size {
            return Err(LayoutSkip::LocalBufferTooLarge {
                local_buffer_bytes,
                max_work_group_size: limits.max_work_group_size,
            });
        }
        if work_groups == 0 {
            return Err(LayoutSkip::NoWorkGroups);
        }

        let total_planes = work_groups * local_size * PLANES_PER_WORK_ITEM;
        let in_bytes = elem
            * (total_planes * LINES * src_line_stride + (total_planes - 1) * params.src_plane_margin);
        let out_bytes = elem
            * (total_planes * LINES * dst_line_stride + (total_planes - 1) * params.dst_plane_margin);
        Ok(Self {
            params,
            direction,
            src_line_stride,
            dst_line_stride,
            src_plane_stride,
            dst_plane_stride,
            local_size,
            work_groups,
            local_buffer_bytes,
            total_planes,
            in_bytes,
            out_bytes,
        })
    }
    pub fn global_size(&self) -> usize {
        self.work_groups * self.local_size
    }
    pub fn planes_per_work_group(&self) -> usize {
        self.local_size * PLANES_PER_WORK_ITEM
    }
    /// Byte offset of an element in the source.
    #[inline]
    pub fn src_offset(&self, plane: usize, line: usize, element: usize) -> usize {
        self.params.elem_size
            * (plane * self.src_plane_stride + line * self.src_line_stride + element)
    }
    /// Byte offset of an element in the destination.
    #[inline]
    pub fn dst_offset(&self, plane: usize, line: usize, element: usize) -> usize {
        self.params.elem_size
            * (plane * self.dst_plane_stride + line * self.dst_line_stride + element)
    }
    fn elements(&self) -> impl Iterator<Item = (usize, usize, usize)> {
        let planes = self.total_planes;
        (0..planes).flat_map(|plane| {
            (0..LINES).flat_map(move |line| {
                (0..ELEMENTS_PER_LINE).map(move |element| (plane, line, element))
            })
        })
    }
}

/// Generates the kernel for `direction`, with elements of `elem_size` bytes.
///
/// Kernel `test_fn(src, dst, local, elements_per_line, lines, planes_per_group,
/// planes_per_item, src_line_stride, dst_line_stride, src_plane_stride,
/// dst_plane_stride)`.
pub fn kernel_source(direction: CopyDirection, elem_size: usize) -> String {
    let body = match direction {
        CopyDirection::GlobalToLocal => GLOBAL_TO_LOCAL,
        CopyDirection::LocalToGlobal => LOCAL_TO_GLOBAL,
    };
    format!("{KERNEL_HEADER}#define STRUCT_SIZE {elem_size}\n{KERNEL_TYPES}{body}")
}

static KERNEL_HEADER: &str = "#pragma OPENCL EXTENSION cl_khr_extended_async_copies : enable\n";

static KERNEL_TYPES: &str = r#"
typedef struct __attribute__((packed)) {
    uchar bytes[STRUCT_SIZE];
} elem_t __attribute__((aligned(1)));

void zero_local(__local elem_t* local_buf, int planes_per_item, int lines,
                int elements_per_line, int line_stride, int plane_stride) {
    for (int p = 0; p < planes_per_item; p++) {
        for (int l = 0; l < lines; l++) {
            for (int e = 0; e < elements_per_line; e++) {
                int idx = (get_local_id(0) * planes_per_item + p) * plane_stride + l * line_stride + e;
                for (int b = 0; b < STRUCT_SIZE; b++) {
                    local_buf[idx].bytes[b] = 0;
                }
            }
        }
    }
}
"#;

static GLOBAL_TO_LOCAL: &str = r#"
__kernel void test_fn(const __global elem_t* src, __global elem_t* dst, __local elem_t* local_buf,
                      int elements_per_line, int lines, int planes_per_group, int planes_per_item,
                      int src_line_stride, int dst_line_stride, int src_plane_stride, int dst_plane_stride) {
    zero_local(local_buf, planes_per_item, lines, elements_per_line, dst_line_stride, dst_plane_stride);
    barrier(CLK_LOCAL_MEM_FENCE);

    event_t event = async_work_group_copy_3D3D(local_buf, 0, src,
        planes_per_group * get_group_id(0) * src_plane_stride, sizeof(elem_t),
        (size_t)elements_per_line, (size_t)lines, planes_per_group,
        src_line_stride, src_plane_stride, dst_line_stride, dst_plane_stride, 0);
    wait_group_events(1, &event);

    for (int p = 0; p < planes_per_item; p++) {
        for (int l = 0; l < lines; l++) {
            for (int e = 0; e < elements_per_line; e++) {
                int local_idx = (get_local_id(0) * planes_per_item + p) * dst_plane_stride + l * dst_line_stride + e;
                int global_idx = (get_global_id(0) * planes_per_item + p) * dst_plane_stride + l * dst_line_stride + e;
                dst[global_idx] = local_buf[local_idx];
            }
        }
    }
}
"#;

static LOCAL_TO_GLOBAL: &str = r#"
__kernel void test_fn(const __global elem_t* src, __global elem_t* dst, __local elem_t* local_buf,
                      int elements_per_line, int lines, int planes_per_group, int planes_per_item,
                      int src_line_stride, int dst_line_stride, int src_plane_stride, int dst_plane_stride) {
    zero_local(local_buf, planes_per_item, lines, elements_per_line, src_line_stride, src_plane_stride);
    barrier(CLK_LOCAL_MEM_FENCE);

    for (int p = 0; p < planes_per_item; p++) {
        for (int l = 0; l < lines; l++) {
            for (int e = 0; e < elements_per_line; e++) {
                int local_idx = (get_local_id(0) * planes_per_item + p) * src_plane_stride + l * src_line_stride + e;
                int global_idx = (get_global_id(0) * planes_per_item + p) * src_plane_stride + l * src_line_stride + e;
                local_buf[local_idx] = src[global_idx];
            }
        }
    }
    barrier(CLK_LOCAL_MEM_FENCE);

    event_t event = async_work_group_copy_3D3D(dst,
        planes_per_group * get_group_id(0) * dst_plane_stride, local_buf, 0, sizeof(elem_t),
        (size_t)elements_per_line, (size_t)lines, planes_per_group,
        src_line_stride, src_plane_stride, dst_line_stride, dst_plane_stride, 0);
    wait_group_events(1, &event);
}
"#;

/// Performs the copy on the host, as a conforming device would.
///
/// Margins of `dst` are not written.
pub fn simulate_copy(layout: &Copy3dLayout, src: &[u8], dst: &mut [u8]) {
    let n = layout.params.elem_size;
    for (plane, line, element) in layout.elements() {
        let s = layout.src_offset(plane, line, element);
        let d = layout.dst_offset(plane, line, element);
        dst[d..d + n].copy_from_slice(&src[s..s + n]);
    }
}

/// A difference between the device output and the expected output.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CopyMismatch {
    Element {
        plane: usize,
        line: usize,
        element: usize,
        src_offset: usize,
        expected: Vec<u8>,
        actual: Vec<u8>,
    },
    /// The margin after a line was written.
    LineMargin { plane: usize, line: usize },
    /// The margin after a plane was written.
    PlaneMargin { plane: usize },
}

fn hex_bytes(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 3);
    for b in bytes {
        let _ = write!(s, "{b:2x} ");
    }
    s
}

impl Display for CopyMismatch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Element {
                src_offset,
                expected,
                actual,
                ..
            } => write!(
                f,
                "{src_offset} -> [{}] != [{}]",
                hex_bytes(expected),
                hex_bytes(actual)
            ),
            Self::LineMargin { plane, line } => write!(
                f,
                "3D copy corrupted data in output buffer in the line stride offset of plane {plane} line {line}"
            ),
            Self::PlaneMargin { plane } => write!(
                f,
                "3D copy corrupted data in output buffer in the plane stride offset of plane {plane}"
            ),
        }
    }
}

/// The mismatches found by [`verify_copy`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CopyReport {
    pub mismatches: Vec<CopyMismatch>,
    /// Verification stopped early.
    pub truncated: bool,
}

impl CopyReport {
    pub fn is_ok(&self) -> bool {
        self.mismatches.is_empty()
    }
    fn push(&mut self, mismatch: CopyMismatch) -> bool {
        self.mismatches.push(mismatch);
        self.truncated = self.mismatches.len() > MAX_REPORTED;
        self.truncated
    }
}

/// Checks `output` against `input`.
///
/// `original` is the destination before the copy, margins must still match it.
pub fn verify_copy(layout: &Copy3dLayout, input: &[u8], output: &[u8], original: &[u8]) -> CopyReport {
    let n = layout.params.elem_size;
    let line_margin = layout.params.dst_line_margin * n;
    let plane_margin = layout.params.dst_plane_margin * n;
    let mut report = CopyReport::default();
    for plane in 0..layout.total_planes {
        for line in 0..LINES {
            for element in 0..ELEMENTS_PER_LINE {
                let s = layout.src_offset(plane, line, element);
                let d = layout.dst_offset(plane, line, element);
                if input[s..s + n] != output[d..d + n] {
                    let mismatch = CopyMismatch::Element {
                        plane,
                        line,
                        element,
                        src_offset: s,
                        expected: input[s..s + n].to_vec(),
                        actual: output[d..d + n].to_vec(),
                    };
                    if report.push(mismatch) {
                        return report;
                    }
                }
            }
            let d = layout.dst_offset(plane, line, ELEMENTS_PER_LINE);
            if output[d..d + line_margin] != original[d..d + line_margin]
                && report.push(CopyMismatch::LineMargin { plane, line })
            {
                return report;
            }
        }
        if plane + 1 < layout.total_planes {
            let d = layout.dst_offset(plane, LINES, 0);
            if output[d..d + plane_margin] != original[d..d + plane_margin]
                && report.push(CopyMismatch::PlaneMargin { plane })
            {
                return report;
            }
        }
    }
    report
}

/// Checks that [`simulate_copy`] passes [`verify_copy`] and that corruption
/// of an element and of each margin is detected.
pub fn self_check() -> Result<()> {
    use anyhow::ensure;

    let limits = DeviceLimits {
        local_mem_size: 32 * 1024,
        global_mem_size: 1 << 22,
        max_alloc_size: 1 << 20,
        max_work_item_size0: 256,
        max_work_group_size: 1 << 16,
        kernel_work_group_size: 4,
    };
    let params = Copy3dParams {
        elem_size: 3,
        src_line_margin: 30,
        dst_line_margin: 3,
        src_plane_margin: 0,
        dst_plane_margin: 30,
    };
    for direction in [CopyDirection::GlobalToLocal, CopyDirection::LocalToGlobal] {
        let layout = Copy3dLayout::new(params, direction, &limits)?;
        let mut gen = DataGen::new(0);
        let input = gen.bytes(layout.in_bytes);
        let original = gen.bytes(layout.out_bytes);
        let mut output = original.clone();
        simulate_copy(&layout, &input, &mut output);
        let report = verify_copy(&layout, &input, &output, &original);
        ensure!(report.is_ok(), "{:?}", report.mismatches);

        let corruptions = [
            layout.dst_offset(1, 2, 3),
            layout.dst_offset(1, 2, ELEMENTS_PER_LINE),
            layout.dst_offset(0, LINES, 0),
        ];
        for offset in corruptions {
            let mut corrupted = output.clone();
            corrupted[offset] = !corrupted[offset];
            let report = verify_copy(&layout, &input, &corrupted, &original);
            ensure!(report.mismatches.len() == 1, "corruption at {offset} not detected");
        }
    }
    Ok(())
}

#[cfg(feature = "device")]
pub use device::{run_global_to_local, run_local_to_global};

#[cfg(feature = "device")]
mod device {
    use super::*;
    use crate::harness::{case_outcome, TestContext, TestOutcome};
    use anyhow::Context as _;
    use ocl::{Buffer, Kernel, Program};
    use tracing::{error, info};

    impl DeviceLimits {
        fn query(ctx: &TestContext, kernel_work_group_size: usize) -> Result<Self> {
            Ok(Self {
                local_mem_size: ctx.local_mem_size()?,
                global_mem_size: ctx.global_mem_size()?,
                max_alloc_size: ctx.max_mem_alloc_size()?,
                max_work_item_size0: ctx.max_work_item_size0()?,
                max_work_group_size: ctx.max_work_group_size()?,
                kernel_work_group_size,
            })
        }
    }

    pub fn run_global_to_local(ctx: &TestContext) -> Result<TestOutcome> {
        run_all(ctx, CopyDirection::GlobalToLocal)
    }

    pub fn run_local_to_global(ctx: &TestContext) -> Result<TestOutcome> {
        run_all(ctx, CopyDirection::LocalToGlobal)
    }

    fn run_all(ctx: &TestContext, direction: CopyDirection) -> Result<TestOutcome> {
        if !ctx.has_extension(EXTENSION)? {
            info!("Device does not support extended async copies. Skipping test.");
            return Ok(TestOutcome::Skip);
        }
        let mut outcome = TestOutcome::Skip;
        let mut errors = 0;
        for elem_size in ELEM_SIZES {
            let (program, limits) = match prepare(ctx, direction, elem_size) {
                Ok(prepared) => prepared,
                Err(e) => {
                    let case = case_outcome(format!("{elem_size} byte elements"), Err(e));
                    errors += 1;
                    outcome = outcome.combine(case);
                    continue;
                }
            };
            for params in Copy3dParams::sweep(elem_size) {
                let result = run_copy3d(ctx, &program, direction, params, &limits);
                let case = case_outcome(params, result);
                errors += case.is_fail() as usize;
                outcome = outcome.combine(case);
            }
        }
        if errors > 0 {
            error!("{errors} copies failed");
        }
        Ok(outcome)
    }

    fn prepare(
        ctx: &TestContext,
        direction: CopyDirection,
        elem_size: usize,
    ) -> Result<(Program, DeviceLimits)> {
        let program = ctx.build_program(&kernel_source(direction, elem_size))?;
        let probe = Kernel::builder().program(&program).name("test_fn").build()?;
        let limits = DeviceLimits::query(ctx, ctx.kernel_work_group_size(&probe)?)?;
        Ok((program, limits))
    }

    fn int_arg(x: usize) -> Result<i32> {
        i32::try_from(x).context("Kernel argument out of range")
    }

    fn run_copy3d(
        ctx: &TestContext,
        program: &Program,
        direction: CopyDirection,
        params: Copy3dParams,
        limits: &DeviceLimits,
    ) -> Result<TestOutcome> {
        info!("Testing {params}");
        let layout = match Copy3dLayout::new(params, direction, limits) {
            Ok(layout) => layout,
            Err(skip) => {
                info!("{skip}");
                return Ok(TestOutcome::Skip);
            }
        };
        info!(
            "Global: {}, local {}, local buffer {}b, global in buffer {}b, global out buffer {}b, each work group will copy {} planes and each work item will copy {} planes.",
            layout.global_size(),
            layout.local_size,
            layout.local_buffer_bytes,
            layout.in_bytes,
            layout.out_bytes,
            layout.planes_per_work_group(),
            PLANES_PER_WORK_ITEM,
        );

        let mut gen = ctx.data_gen();
        let input = gen.bytes(layout.in_bytes);
        let original = gen.bytes(layout.out_bytes);

        let queue = ctx.queue();
        let src = Buffer::<u8>::builder()
            .queue(queue.clone())
            .len(input.len())
            .copy_host_slice(&input)
            .build()?;
        let dst = Buffer::<u8>::builder()
            .queue(queue.clone())
            .len(original.len())
            .copy_host_slice(&original)
            .build()?;

        let kernel = ctx
            .kernel_builder(program, "test_fn")
            .global_work_size(layout.global_size())
            .local_work_size(layout.local_size)
            .arg(&src)
            .arg(&dst)
            .arg_local::<u8>(layout.local_buffer_bytes)
            .arg(int_arg(ELEMENTS_PER_LINE)?)
            .arg(int_arg(LINES)?)
            .arg(int_arg(layout.planes_per_work_group())?)
            .arg(int_arg(PLANES_PER_WORK_ITEM)?)
            .arg(int_arg(layout.src_line_stride)?)
            .arg(int_arg(layout.dst_line_stride)?)
            .arg(int_arg(layout.src_plane_stride)?)
            .arg(int_arg(layout.dst_plane_stride)?)
            .build()?;
        unsafe {
            kernel.enq().context("Unable to queue kernel")?;
        }

        let mut output = vec![0u8; layout.out_bytes];
        dst.read(&mut output).enq().context("Unable to read results")?;

        let report = verify_copy(&layout, &input, &output, &original);
        if report.is_ok() {
            return Ok(TestOutcome::Pass);
        }
        error!("ERROR: Results of copy did not validate!");
        for mismatch in report.mismatches.iter() {
            error!("{mismatch}");
        }
        if report.truncated {
            error!("Not printing further failures...");
        }
        Ok(TestOutcome::Fail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> DeviceLimits {
        DeviceLimits {
            local_mem_size: 64 * 1024,
            global_mem_size: 1 << 30,
            max_alloc_size: 1 << 28,
            max_work_item_size0: 1024,
            max_work_group_size: 1 << 20,
            kernel_work_group_size: 256,
        }
    }

    fn params(elem_size: usize, margins: [usize; 4]) -> Copy3dParams {
        let [src_line, dst_line, src_plane, dst_plane] = margins;
        Copy3dParams {
            elem_size,
            src_line_margin: src_line * elem_size,
            dst_line_margin: dst_line * elem_size,
            src_plane_margin: src_plane * elem_size,
            dst_plane_margin: dst_plane * elem_size,
        }
    }

    #[test]
    fn sweep_covers_all_margins() {
        let sweep: Vec<_> = Copy3dParams::sweep(2).collect();
        assert_eq!(sweep.len(), 81);
        assert_eq!(sweep[0], params(2, [0, 0, 0, 0]));
        assert_eq!(sweep[80], params(2, [100, 100, 100, 100]));
        assert!(sweep.iter().all(|x| x.dst_plane_margin % 2 == 0));
    }

    #[test]
    fn layout_packed() {
        let layout =
            Copy3dLayout::new(params(4, [0, 0, 0, 0]), CopyDirection::GlobalToLocal, &limits())
                .unwrap();
        assert_eq!(layout.src_line_stride, 10);
        assert_eq!(layout.src_plane_stride, 130);
        // 32KB / (4 * 2 * 130) = 31 items
        assert_eq!(layout.local_size, 31);
        assert_eq!(layout.local_buffer_bytes, 31 * 4 * 2 * 130);
        assert_eq!(layout.work_groups, MAX_WORK_GROUPS);
        assert_eq!(layout.total_planes, MAX_WORK_GROUPS * 31 * 2);
        assert_eq!(layout.in_bytes, 4 * layout.total_planes * 130);
        assert_eq!(layout.in_bytes, layout.out_bytes);
        assert_eq!(layout.global_size(), MAX_WORK_GROUPS * 31);
    }

    #[test]
    fn layout_margins() {
        let p = params(1, [10, 0, 100, 10]);
        let layout = Copy3dLayout::new(p, CopyDirection::LocalToGlobal, &limits()).unwrap();
        assert_eq!(layout.src_line_stride, 20);
        assert_eq!(layout.dst_line_stride, 10);
        assert_eq!(layout.src_plane_stride, 13 * 20 + 100);
        assert_eq!(layout.dst_plane_stride, 130 + 10);
        // local side is the source
        let per_item = 2 * layout.src_plane_stride;
        assert_eq!(layout.local_size, (32 * 1024 / per_item).min(256));
        assert_eq!(layout.local_buffer_bytes, layout.local_size * per_item - 100);
        let planes = layout.total_planes;
        assert_eq!(layout.in_bytes, planes * 13 * 20 + (planes - 1) * 100);
        assert_eq!(layout.out_bytes, planes * 130 + (planes - 1) * 10);
        // the last line margin ends the buffer
        let end = layout.dst_offset(planes - 1, LINES - 1, ELEMENTS_PER_LINE) + p.dst_line_margin;
        assert_eq!(end, layout.out_bytes);
    }

    #[test]
    fn layout_small_local_memory() {
        let limits = DeviceLimits {
            local_mem_size: 1024,
            max_work_group_size: 64,
            ..limits()
        };
        let layout =
            Copy3dLayout::new(params(64, [0, 0, 0, 0]), CopyDirection::GlobalToLocal, &limits);
        // local size clamps to 1, but the buffer still exceeds the limit check
        assert_eq!(
            layout,
            Err(LayoutSkip::LocalBufferTooLarge {
                local_buffer_bytes: 64 * 2 * 130,
                max_work_group_size: 64,
            })
        );
    }

    #[test]
    fn layout_no_memory() {
        let limits = DeviceLimits {
            global_mem_size: 1024,
            max_alloc_size: 1024,
            ..limits()
        };
        let layout =
            Copy3dLayout::new(params(8, [0, 0, 0, 0]), CopyDirection::LocalToGlobal, &limits);
        assert_eq!(layout, Err(LayoutSkip::NoWorkGroups));
    }

    fn small_layout(p: Copy3dParams) -> Copy3dLayout {
        let limits = DeviceLimits {
            kernel_work_group_size: 2,
            global_mem_size: 1 << 23,
            max_alloc_size: 1 << 21,
            ..limits()
        };
        Copy3dLayout::new(p, CopyDirection::GlobalToLocal, &limits).unwrap()
    }

    #[test]
    fn simulated_copy_verifies() {
        for elem_size in [1, 5, 16] {
            for p in Copy3dParams::sweep(elem_size).step_by(7) {
                let layout = small_layout(p);
                let mut gen = DataGen::new(elem_size as u64);
                let input = gen.bytes(layout.in_bytes);
                let original = gen.bytes(layout.out_bytes);
                let mut output = original.clone();
                simulate_copy(&layout, &input, &mut output);
                let report = verify_copy(&layout, &input, &output, &original);
                assert!(report.is_ok(), "{p}: {:?}", report.mismatches);
            }
        }
    }

    #[test]
    fn verify_detects_element_mismatch() {
        let layout = small_layout(params(2, [10, 10, 0, 10]));
        let input = vec![7u8; layout.in_bytes];
        let original = vec![0u8; layout.out_bytes];
        let mut output = original.clone();
        simulate_copy(&layout, &input, &mut output);
        let d = layout.dst_offset(0, 1, 4);
        output[d + 1] = 9;
        let report = verify_copy(&layout, &input, &output, &original);
        assert_eq!(
            report.mismatches,
            [CopyMismatch::Element {
                plane: 0,
                line: 1,
                element: 4,
                src_offset: layout.src_offset(0, 1, 4),
                expected: vec![7, 7],
                actual: vec![7, 9],
            }]
        );
        assert!(!report.truncated);
        assert_eq!(
            report.mismatches[0].to_string(),
            format!("{} -> [ 7  7 ] != [ 7  9 ]", layout.src_offset(0, 1, 4))
        );
    }

    #[test]
    fn verify_detects_margin_writes() {
        let layout = small_layout(params(1, [0, 10, 0, 100]));
        let input = vec![1u8; layout.in_bytes];
        let original = vec![0u8; layout.out_bytes];
        let mut output = original.clone();
        simulate_copy(&layout, &input, &mut output);
        output[layout.dst_offset(2, 5, ELEMENTS_PER_LINE + 3)] = 1;
        output[layout.dst_offset(3, LINES, 50)] = 1;
        let report = verify_copy(&layout, &input, &output, &original);
        assert_eq!(
            report.mismatches,
            [
                CopyMismatch::LineMargin { plane: 2, line: 5 },
                CopyMismatch::PlaneMargin { plane: 3 },
            ]
        );
    }

    #[test]
    fn verify_ignores_tail_after_last_plane() {
        let layout = small_layout(params(1, [0, 0, 0, 10]));
        let input = vec![3u8; layout.in_bytes];
        let original = vec![0u8; layout.out_bytes];
        let mut output = original.clone();
        simulate_copy(&layout, &input, &mut output);
        // there is no plane margin after the last plane
        assert_eq!(
            layout.dst_offset(layout.total_planes - 1, LINES, 0),
            layout.out_bytes
        );
        assert!(verify_copy(&layout, &input, &output, &original).is_ok());
    }

    #[test]
    fn verify_truncates_report() {
        let layout = small_layout(params(1, [0, 0, 0, 0]));
        let input = vec![1u8; layout.in_bytes];
        let original = vec![0u8; layout.out_bytes];
        let report = verify_copy(&layout, &input, &original, &original);
        assert_eq!(report.mismatches.len(), MAX_REPORTED + 1);
        assert!(report.truncated);
    }

    #[test]
    fn kernel_source_defines_struct_size() {
        let src = kernel_source(CopyDirection::LocalToGlobal, 47);
        assert!(src.starts_with(KERNEL_HEADER));
        assert!(src.contains("#define STRUCT_SIZE 47\n"));
        assert!(src.contains("async_work_group_copy_3D3D(dst,"));
        let src = kernel_source(CopyDirection::GlobalToLocal, 1);
        assert!(src.contains("async_work_group_copy_3D3D(local_buf, 0, src,"));
        assert_eq!(src.matches("__kernel").count(), 1);
    }

    #[test]
    fn host_self_check() {
        self_check().unwrap();
    }
}
