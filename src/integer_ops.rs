/*!
`add_sat` for every integer type and vector width.

The inputs are random 32-bit words, reinterpreted as each integer type, so every
type sees the same bytes. The output is filled with [`OUTPUT_PATTERN`] before
each launch, unwritten elements show up as mismatches.
*/
use crate::{
    harness::DataGen,
    result::Result,
    scalar::{verify_add_sat, IntType, SatInt, VectorWidth},
};
use std::mem::size_of;

/// Written to the output buffer before each kernel launch.
pub const OUTPUT_PATTERN: u32 = 0xdeadbeef;

pub fn add_sat_kernel_name(ty: IntType, width: VectorWidth) -> String {
    format!("test_add_sat_{ty}{}", width.suffix())
}

/// Generates the kernel computing `dst[i] = add_sat(srcA[i], srcB[i])`.
///
/// Vectors of 3 are loaded and stored with `vload3` / `vstore3` from scalar
/// pointers, as they have the size and alignment of vectors of 4.
pub fn add_sat_kernel_source(ty: IntType, width: VectorWidth) -> String {
    let name = add_sat_kernel_name(ty, width);
    let vec_ty = format!("{ty}{}", width.suffix());
    if width == VectorWidth::THREE {
        format!(
            r#"__kernel void {name}(__global {ty} *srcA, __global {ty} *srcB, __global {ty} *dst)
{{
    int tid = get_global_id(0);
    {vec_ty} tmp = add_sat(vload3(tid, srcA), vload3(tid, srcB));
    vstore3(tmp, tid, dst);
}}
"#
        )
    } else {
        format!(
            r#"__kernel void {name}(__global {vec_ty} *srcA, __global {vec_ty} *srcB, __global {vec_ty} *dst)
{{
    int tid = get_global_id(0);
    {vec_ty} tmp = add_sat(srcA[tid], srcB[tid]);
    dst[tid] = tmp;
}}
"#
        )
    }
}

/// Fills `bytes` with [`OUTPUT_PATTERN`], in native byte order.
pub fn fill_pattern(bytes: &mut [u8]) {
    let pattern = OUTPUT_PATTERN.to_ne_bytes();
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = pattern[i % 4];
    }
}

/// Number of work items, each computing one vector.
pub fn work_items(byte_len: usize, ty: IntType, width: VectorWidth) -> usize {
    byte_len / ty.size() / width.get()
}

fn read_elems<T: SatInt>(bytes: &[u8], n: usize) -> Vec<T> {
    bytes
        .chunks_exact(size_of::<T>())
        .take(n)
        .map(bytemuck::pod_read_unaligned)
        .collect()
}

fn first_mismatch<T: SatInt>(
    a: &[u8],
    b: &[u8],
    out: &[u8],
    width: VectorWidth,
    items: usize,
) -> Option<String> {
    let n = items * width.get();
    let (a, b, out) = (
        read_elems::<T>(a, n),
        read_elems::<T>(b, n),
        read_elems::<T>(out, n),
    );
    verify_add_sat(&a, &b, &out, width).map(|x| x.to_string())
}

/// Checks the first `items` vectors of `out`, returns a report of the first
/// mismatch.
pub fn verify_add_sat_bytes(
    ty: IntType,
    width: VectorWidth,
    a: &[u8],
    b: &[u8],
    out: &[u8],
    items: usize,
) -> Option<String> {
    use IntType::*;
    match ty {
        Char => first_mismatch::<i8>(a, b, out, width, items),
        UChar => first_mismatch::<u8>(a, b, out, width, items),
        Short => first_mismatch::<i16>(a, b, out, width, items),
        UShort => first_mismatch::<u16>(a, b, out, width, items),
        Int => first_mismatch::<i32>(a, b, out, width, items),
        UInt => first_mismatch::<u32>(a, b, out, width, items),
        Long => first_mismatch::<i64>(a, b, out, width, items),
        ULong => first_mismatch::<u64>(a, b, out, width, items),
    }
}

fn reference_bytes<T: SatInt>(a: &[u8], b: &[u8]) -> Vec<u8> {
    let n = a.len() / size_of::<T>();
    read_elems::<T>(a, n)
        .into_iter()
        .zip(read_elems::<T>(b, n))
        .flat_map(|(a, b)| bytemuck::bytes_of(&a.add_sat_ref(b)).to_vec())
        .collect()
}

/// Checks that the reference output passes and the pattern fails, for every
/// type and width.
pub fn self_check() -> Result<()> {
    use anyhow::{bail, ensure};

    let mut gen = DataGen::new(0);
    let a = bytemuck::cast_slice::<u32, u8>(&gen.words(4 * 64)).to_vec();
    let b = bytemuck::cast_slice::<u32, u8>(&gen.words(4 * 64)).to_vec();
    for ty in IntType::iter() {
        let expected = {
            use IntType::*;
            match ty {
                Char => reference_bytes::<i8>(&a, &b),
                UChar => reference_bytes::<u8>(&a, &b),
                Short => reference_bytes::<i16>(&a, &b),
                UShort => reference_bytes::<u16>(&a, &b),
                Int => reference_bytes::<i32>(&a, &b),
                UInt => reference_bytes::<u32>(&a, &b),
                Long => reference_bytes::<i64>(&a, &b),
                ULong => reference_bytes::<u64>(&a, &b),
            }
        };
        let mut pattern = vec![0u8; a.len()];
        fill_pattern(&mut pattern);
        for width in VectorWidth::iter() {
            let items = work_items(a.len(), ty, width);
            if let Some(mismatch) = verify_add_sat_bytes(ty, width, &a, &b, &expected, items) {
                bail!("{mismatch}");
            }
            ensure!(
                verify_add_sat_bytes(ty, width, &a, &b, &pattern, items).is_some(),
                "unwritten output not detected for {}",
                add_sat_kernel_name(ty, width)
            );
        }
    }
    Ok(())
}

#[cfg(feature = "device")]
pub use device::run_add_sat;

#[cfg(feature = "device")]
mod device {
    use super::*;
    use crate::harness::{TestContext, TestOutcome};
    use anyhow::Context as _;
    use ocl::Buffer;
    use tracing::{error, info, warn};

    pub fn run_add_sat(ctx: &TestContext) -> Result<TestOutcome> {
        let words = 4 * ctx.config().num_elements;
        let mut gen = ctx.data_gen();
        let a = bytemuck::cast_slice::<u32, u8>(&gen.words(words)).to_vec();
        let b = bytemuck::cast_slice::<u32, u8>(&gen.words(words)).to_vec();
        let byte_len = a.len();
        let supports_int64 = ctx.supports_int64()?;
        let queue = ctx.queue();
        let mut failures = 0;
        for ty in IntType::iter() {
            if ty.is_64bit() && !supports_int64 {
                warn!("64 bit integers are not supported on this device. Skipping {ty}");
                continue;
            }
            let src_a = Buffer::<u8>::builder()
                .queue(queue.clone())
                .len(byte_len)
                .copy_host_slice(&a)
                .build()?;
            let src_b = Buffer::<u8>::builder()
                .queue(queue.clone())
                .len(byte_len)
                .copy_host_slice(&b)
                .build()?;
            let dst = Buffer::<u8>::builder()
                .queue(queue.clone())
                .len(byte_len)
                .build()?;
            let mut out = vec![0u8; byte_len];
            for width in VectorWidth::iter() {
                let name = add_sat_kernel_name(ty, width);
                let program = ctx.build_program(&add_sat_kernel_source(ty, width))?;
                fill_pattern(&mut out);
                dst.write(&out).enq().context("Unable to clear output")?;
                let items = work_items(byte_len, ty, width);
                let kernel = ctx
                    .kernel_builder(&program, &name)
                    .global_work_size(items)
                    .arg(&src_a)
                    .arg(&src_b)
                    .arg(&dst)
                    .build()?;
                unsafe {
                    kernel.enq().with_context(|| format!("Unable to run {name}"))?;
                }
                dst.read(&mut out).enq().context("Unable to read output")?;
                if let Some(mismatch) = verify_add_sat_bytes(ty, width, &a, &b, &out, items) {
                    error!("{mismatch}");
                    failures += 1;
                }
            }
            info!("{ty} done");
        }
        if failures > 0 {
            error!("Failed on {failures} types");
            return Ok(TestOutcome::Fail);
        }
        Ok(TestOutcome::Pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_names() {
        assert_eq!(
            add_sat_kernel_name(IntType::UShort, VectorWidth::ONE),
            "test_add_sat_ushort"
        );
        assert_eq!(
            add_sat_kernel_name(IntType::Long, VectorWidth::new(16).unwrap()),
            "test_add_sat_long16"
        );
    }

    #[test]
    fn kernel_source_vector() {
        let src = add_sat_kernel_source(IntType::Char, VectorWidth::new(4).unwrap());
        assert!(src.starts_with("__kernel void test_add_sat_char4(__global char4 *srcA,"));
        assert!(src.contains("char4 tmp = add_sat(srcA[tid], srcB[tid]);"));
        assert!(!src.contains("vload3"));
    }

    #[test]
    fn kernel_source_vector3() {
        let src = add_sat_kernel_source(IntType::UInt, VectorWidth::THREE);
        assert!(src.starts_with("__kernel void test_add_sat_uint3(__global uint *srcA,"));
        assert!(src.contains("uint3 tmp = add_sat(vload3(tid, srcA), vload3(tid, srcB));"));
        assert!(src.contains("vstore3(tmp, tid, dst);"));
    }

    #[test]
    fn pattern_fill() {
        let mut bytes = [0u8; 10];
        fill_pattern(&mut bytes);
        let word: u32 = bytemuck::pod_read_unaligned(&bytes[4..8]);
        assert_eq!(word, OUTPUT_PATTERN);
        assert_eq!(bytes[8..], OUTPUT_PATTERN.to_ne_bytes()[..2]);
    }

    #[test]
    fn work_item_counts() {
        // 4 * 2048 words
        let len = 4 * 2048 * 4;
        assert_eq!(work_items(len, IntType::Char, VectorWidth::ONE), len);
        assert_eq!(work_items(len, IntType::Short, VectorWidth::THREE), len / 6);
        assert_eq!(work_items(len, IntType::ULong, VectorWidth::new(16).unwrap()), len / 128);
    }

    #[test]
    fn verify_bytes_reports_mismatch() {
        let a = 100i8.to_ne_bytes().repeat(8);
        let b = 100i8.to_ne_bytes().repeat(8);
        let mut out = 127i8.to_ne_bytes().repeat(8);
        let width = VectorWidth::new(4).unwrap();
        assert_eq!(verify_add_sat_bytes(IntType::Char, width, &a, &b, &out, 2), None);
        // uchar saturates at 200
        assert!(verify_add_sat_bytes(IntType::UChar, width, &a, &b, &out, 2).is_some());
        out[6] = 0;
        let report = verify_add_sat_bytes(IntType::Char, width, &a, &b, &out, 2).unwrap();
        assert_eq!(
            report,
            "6) Failure for add_sat( (char4) 0x64, (char4) 0x64) = *0x7f vs 0x00"
        );
        // only the first item is checked
        assert_eq!(verify_add_sat_bytes(IntType::Char, width, &a, &b, &out, 1), None);
    }

    #[test]
    fn verify_bytes_unaligned_long() {
        let a: Vec<u8> = [0u8].into_iter().chain(i64::MAX.to_ne_bytes()).collect();
        let b: Vec<u8> = [0u8].into_iter().chain(1i64.to_ne_bytes()).collect();
        let out: Vec<u8> = [0u8].into_iter().chain(i64::MAX.to_ne_bytes()).collect();
        assert_eq!(
            verify_add_sat_bytes(IntType::Long, VectorWidth::ONE, &a[1..], &b[1..], &out[1..], 1),
            None
        );
    }

    #[test]
    fn host_self_check() {
        self_check().unwrap();
    }
}
