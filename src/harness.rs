/*!
Test harness.

A [`ConformanceTest`] is registered in [`registry()`]. With the "device" feature
each test runs against a [`TestContext`], which owns the OpenCL platform,
device, context and queue selected by [`Config`]. Without it only the host
self checks are available.

Tests are converted to [`libtest_mimic::Trial`]s, so the usual `--list`,
filtering and `--ignored` flags work.
*/
use crate::{image::ImageSizeMode, result::Result};
use libtest_mimic::{Failed, Trial};
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
#[cfg(feature = "device")]
use std::sync::Arc;
use tracing::{error, info};

#[cfg(feature = "device")]
pub use device::TestContext;

/// Errors.
pub mod error {
    /// No OpenCL platform was found.
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("DeviceUnavailable")]
    pub struct DeviceUnavailable;

    /// The platform index is greater than or equal to the number of platforms.
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("Platform index {index} is out of range 0..{platforms}!")]
    pub struct PlatformIndexOutOfRange {
        pub(crate) index: usize,
        pub(crate) platforms: usize,
    }

    /// The device index is greater than or equal to the number of devices.
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("Device index {index} is out of range 0..{devices}!")]
    pub struct DeviceIndexOutOfRange {
        pub(crate) index: usize,
        pub(crate) devices: usize,
    }

    /// An environment variable could not be parsed.
    #[derive(Clone, Debug, thiserror::Error)]
    #[error("Invalid value {value:?} for {var}!")]
    pub struct InvalidConfig {
        pub(crate) var: &'static str,
        pub(crate) value: String,
    }
}
use error::*;

/// The result of a conformance test.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TestOutcome {
    Pass,
    Fail,
    /// The device does not support what is being tested, or lacks the resources.
    Skip,
}

impl TestOutcome {
    /// Combines the outcomes of sub tests.
    ///
    /// Any failure fails, otherwise any pass passes.
    pub fn combine(self, other: Self) -> Self {
        use TestOutcome::*;
        match (self, other) {
            (Fail, _) | (_, Fail) => Fail,
            (Pass, _) | (_, Pass) => Pass,
            (Skip, Skip) => Skip,
        }
    }
    pub fn is_fail(&self) -> bool {
        *self == TestOutcome::Fail
    }
}

impl FromIterator<TestOutcome> for TestOutcome {
    fn from_iter<I: IntoIterator<Item = TestOutcome>>(iter: I) -> Self {
        iter.into_iter()
            .fold(TestOutcome::Skip, TestOutcome::combine)
    }
}

/// Configuration, read from the environment.
///
/// | variable | default |
/// |---|---|
/// | `CLCONFORM_PLATFORM` | 0 |
/// | `CLCONFORM_DEVICE` | 0 |
/// | `CLCONFORM_SEED` | 0x5eed |
/// | `CLCONFORM_NUM_ELEMENTS` | 2048 |
/// | `CLCONFORM_IMAGE_SIZES` | random |
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub platform: usize,
    pub device: usize,
    pub seed: u64,
    pub num_elements: usize,
    pub image_sizes: ImageSizeMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            platform: 0,
            device: 0,
            seed: 0x5eed,
            num_elements: 2048,
            image_sizes: ImageSizeMode::Random,
        }
    }
}

impl Config {
    /// Reads the config from environment variables.
    ///
    /// **errors**
    /// - [`InvalidConfig`](error::InvalidConfig)
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|var| std::env::var(var).ok())
    }
    /// Reads the config with `lookup`, using defaults for missing variables.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        fn parse<T: FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            var: &'static str,
            default: T,
        ) -> Result<T, InvalidConfig> {
            match lookup(var) {
                Some(value) => value
                    .trim()
                    .parse()
                    .map_err(|_| InvalidConfig { var, value }),
                None => Ok(default),
            }
        }
        let default = Self::default();
        let seed = match lookup("CLCONFORM_SEED") {
            Some(value) => parse_seed(&value).ok_or(InvalidConfig {
                var: "CLCONFORM_SEED",
                value,
            })?,
            None => default.seed,
        };
        let num_elements = parse(&lookup, "CLCONFORM_NUM_ELEMENTS", default.num_elements)?;
        if num_elements == 0 {
            return Err(InvalidConfig {
                var: "CLCONFORM_NUM_ELEMENTS",
                value: num_elements.to_string(),
            }
            .into());
        }
        Ok(Self {
            platform: parse(&lookup, "CLCONFORM_PLATFORM", default.platform)?,
            device: parse(&lookup, "CLCONFORM_DEVICE", default.device)?,
            seed,
            num_elements,
            image_sizes: parse(&lookup, "CLCONFORM_IMAGE_SIZES", default.image_sizes)?,
        })
    }
}

// decimal or 0x prefixed hex
fn parse_seed(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Some(hex) = value.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()
    } else {
        value.parse().ok()
    }
}

/// Deterministic random test data.
pub struct DataGen {
    rng: ChaCha8Rng,
}

impl DataGen {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
    pub fn bytes(&mut self, len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; len];
        self.rng.fill_bytes(&mut bytes);
        bytes
    }
    pub fn words(&mut self, len: usize) -> Vec<u32> {
        (0..len).map(|_| self.rng.next_u32()).collect()
    }
    /// A value in `min..=max`, biased towards `max`.
    ///
    /// Computed as `min + (max - min) * log2(1 + u)` for uniform `u` in [0, 1].
    pub fn log_in_range(&mut self, min: usize, max: usize) -> usize {
        if max <= min {
            return min;
        }
        let u: f64 = self.rng.gen_range(0.0..=1.0);
        let v = (u + 1.).log2();
        min + ((max - min) as f64 * v) as usize
    }
}

/// Whether `name` is in the space separated `extensions` string.
pub fn has_extension(extensions: &str, name: &str) -> bool {
    extensions.split_whitespace().any(|x| x == name)
}

/// A registered conformance test.
#[derive(Clone, Copy)]
pub struct ConformanceTest {
    pub name: &'static str,
    /// The test is ignored when the device does not report this extension.
    pub extension: Option<&'static str>,
    /// Checks the host reference against itself, without a device.
    pub self_check: fn() -> Result<()>,
    #[cfg(feature = "device")]
    pub run: fn(&TestContext) -> Result<TestOutcome>,
}

impl std::fmt::Debug for ConformanceTest {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ConformanceTest")
            .field("name", &self.name)
            .field("extension", &self.extension)
            .finish()
    }
}

/// All conformance tests.
pub fn registry() -> Vec<ConformanceTest> {
    use crate::{async_copy, external_memory, image, integer_ops};
    vec![
        ConformanceTest {
            name: "async_copy_global_to_local3D",
            extension: Some(async_copy::EXTENSION),
            self_check: async_copy::self_check,
            #[cfg(feature = "device")]
            run: async_copy::run_global_to_local,
        },
        ConformanceTest {
            name: "async_copy_local_to_global3D",
            extension: Some(async_copy::EXTENSION),
            self_check: async_copy::self_check,
            #[cfg(feature = "device")]
            run: async_copy::run_local_to_global,
        },
        ConformanceTest {
            name: "integer_add_sat",
            extension: None,
            self_check: integer_ops::self_check,
            #[cfg(feature = "device")]
            run: integer_ops::run_add_sat,
        },
        ConformanceTest {
            name: "get_image_info_1D_buffer",
            extension: None,
            self_check: image::self_check,
            #[cfg(feature = "device")]
            run: image::run_1d_buffer_info,
        },
        ConformanceTest {
            name: "external_memory_ahb_images",
            extension: Some(external_memory::EXTENSION),
            self_check: external_memory::self_check,
            #[cfg(feature = "device")]
            run: external_memory::run_images,
        },
        ConformanceTest {
            name: "external_memory_ahb_blob",
            extension: Some(external_memory::EXTENSION),
            self_check: external_memory::self_check,
            #[cfg(feature = "device")]
            run: external_memory::run_blob,
        },
    ]
}

/// Trials running the host self check of each test, named `{test}_host`.
pub fn host_trials() -> Vec<Trial> {
    registry()
        .into_iter()
        .map(|test| {
            let check = test.self_check;
            Trial::test(format!("{}_host", test.name), move || {
                check().map_err(|e| Failed::from(format!("{e:#}")))
            })
        })
        .collect()
}

/// Trials running each test on the device, named `{test}_device`.
///
/// Tests requiring an extension the device does not report are ignored.
#[cfg(feature = "device")]
pub fn device_trials(ctx: &Arc<TestContext>) -> Result<Vec<Trial>> {
    let mut trials = Vec::new();
    let extensions = ctx.extensions()?;
    for test in registry() {
        let supported = is_supported(&test, extensions);
        let ctx = ctx.clone();
        let trial = Trial::test(format!("{}_device", test.name), move || {
            run_on_device(&ctx, &test)
        });
        trials.push(trial.with_ignored_flag(!supported));
    }
    Ok(trials)
}

#[cfg(feature = "device")]
fn run_on_device(ctx: &TestContext, test: &ConformanceTest) -> Result<(), Failed> {
    // tests size their allocations from the device limits, so run one at a time
    let _guard = ctx.lock();
    trial_result(test.name, (test.run)(ctx))
}

/// Whether the device reports the extension `test` requires.
pub fn is_supported(test: &ConformanceTest, extensions: &str) -> bool {
    test.extension
        .map_or(true, |extension| has_extension(extensions, extension))
}

/// The trial result of a test.
///
/// Pass and Skip pass, Fail and errors fail.
pub fn trial_result(name: &str, result: Result<TestOutcome>) -> Result<(), Failed> {
    match result {
        Ok(TestOutcome::Pass) => Ok(()),
        Ok(TestOutcome::Skip) => {
            info!(test = name, "skipped");
            Ok(())
        }
        Ok(TestOutcome::Fail) => Err(format!("{name} failed").into()),
        Err(e) => Err(format!("{name}: {e:#}").into()),
    }
}

/// The outcome of one case, errors are logged and count as Fail.
pub fn case_outcome(case: impl std::fmt::Display, result: Result<TestOutcome>) -> TestOutcome {
    result.unwrap_or_else(|e| {
        error!("{case}: {e:#}");
        TestOutcome::Fail
    })
}

#[cfg(feature = "device")]
mod device {
    use super::{error::*, has_extension, Config, DataGen};
    use crate::result::Result;
    use anyhow::{bail, Context as _};
    use ocl::{
        builders::KernelBuilder,
        enums::{DeviceInfo, DeviceInfoResult, KernelWorkGroupInfo, KernelWorkGroupInfoResult},
        Context, Device, Kernel, Platform, Program, Queue,
    };
    use once_cell::sync::OnceCell;
    use parking_lot::{Mutex, MutexGuard};
    use tracing::{debug, info};

    /// OpenCL objects for the device under test.
    pub struct TestContext {
        platform: Platform,
        device: Device,
        context: Context,
        queue: Queue,
        config: Config,
        extensions: OnceCell<String>,
        lock: Mutex<()>,
    }

    macro_rules! impl_device_info {
        ($($(#[$meta:meta])* $name:ident: $t:ty = $variant:ident;)+) => {
            $(
                $(#[$meta])*
                pub fn $name(&self) -> Result<$t> {
                    match self.device.info(DeviceInfo::$variant)? {
                        DeviceInfoResult::$variant(x) => Ok(x.into()),
                        x => bail!("Unexpected result {x:?} for {}!", stringify!($variant)),
                    }
                }
            )+
        };
    }

    impl TestContext {
        /// Creates a context for the device selected by `config`.
        ///
        /// **errors**
        /// - [`DeviceUnavailable`]: no platforms.
        /// - [`PlatformIndexOutOfRange`]
        /// - [`DeviceIndexOutOfRange`]
        /// - The context or queue could not be created.
        pub fn new(config: Config) -> Result<Self> {
            let platforms = Platform::list();
            if platforms.is_empty() {
                return Err(DeviceUnavailable.into());
            }
            let platform = *platforms
                .get(config.platform)
                .ok_or(PlatformIndexOutOfRange {
                    index: config.platform,
                    platforms: platforms.len(),
                })?;
            let devices = Device::list_all(platform)?;
            let device = *devices.get(config.device).ok_or(DeviceIndexOutOfRange {
                index: config.device,
                devices: devices.len(),
            })?;
            let context = Context::builder()
                .platform(platform)
                .devices(device)
                .build()
                .context("Failed to create context")?;
            let queue = Queue::new(&context, device, None).context("Failed to create queue")?;
            let platform_name = platform.name()?;
            let device_name = device.name()?;
            info!(
                platform = %platform_name,
                device = %device_name,
                "testing device {}",
                config.device
            );
            Ok(Self {
                platform,
                device,
                context,
                queue,
                config,
                extensions: OnceCell::new(),
                lock: Mutex::new(()),
            })
        }
        pub fn config(&self) -> &Config {
            &self.config
        }
        pub fn platform(&self) -> &Platform {
            &self.platform
        }
        pub fn device(&self) -> &Device {
            &self.device
        }
        pub fn context(&self) -> &Context {
            &self.context
        }
        pub fn queue(&self) -> &Queue {
            &self.queue
        }
        /// Random data seeded from the config.
        pub fn data_gen(&self) -> DataGen {
            DataGen::new(self.config.seed)
        }
        pub(super) fn lock(&self) -> MutexGuard<()> {
            self.lock.lock()
        }
        /// The device extensions string.
        pub fn extensions(&self) -> Result<&str> {
            self.extensions
                .get_or_try_init(|| match self.device.info(DeviceInfo::Extensions)? {
                    DeviceInfoResult::Extensions(x) => Ok(x),
                    x => bail!("Unexpected result {x:?} for Extensions!"),
                })
                .map(String::as_str)
        }
        pub fn has_extension(&self, name: &str) -> Result<bool> {
            Ok(has_extension(self.extensions()?, name))
        }
        impl_device_info! {
            local_mem_size: u64 = LocalMemSize;
            global_mem_size: u64 = GlobalMemSize;
            max_mem_alloc_size: u64 = MaxMemAllocSize;
            max_work_group_size: usize = MaxWorkGroupSize;
            /// Max width of a 1D image buffer, in pixels.
            image_max_buffer_size: usize = ImageMaxBufferSize;
            image_support: bool = ImageSupport;
        }
        /// The max number of work items in the first dimension of a work group.
        pub fn max_work_item_size0(&self) -> Result<usize> {
            match self.device.info(DeviceInfo::MaxWorkItemSizes)? {
                DeviceInfoResult::MaxWorkItemSizes(sizes) => sizes
                    .first()
                    .copied()
                    .context("MaxWorkItemSizes is empty!"),
                x => bail!("Unexpected result {x:?} for MaxWorkItemSizes!"),
            }
        }
        /// Whether the device supports long and ulong.
        ///
        /// Full profile devices always do, embedded devices report
        /// `cles_khr_int64`.
        pub fn supports_int64(&self) -> Result<bool> {
            let profile = match self.device.info(DeviceInfo::Profile)? {
                DeviceInfoResult::Profile(x) => x,
                x => bail!("Unexpected result {x:?} for Profile!"),
            };
            Ok(!profile.contains("EMBEDDED") || self.has_extension("cles_khr_int64")?)
        }
        /// Builds `src` for the device.
        pub fn build_program(&self, src: &str) -> Result<Program> {
            debug!("building program:\n{src}");
            Program::builder()
                .src(src)
                .devices(self.device)
                .build(&self.context)
                .context("Failed to build program")
        }
        /// A builder for kernel `name` of `program`, on the test queue.
        ///
        /// Argument types are not checked, buffers of bytes are passed to
        /// kernels taking vectors or structs.
        pub fn kernel_builder<'p>(&self, program: &'p Program, name: &str) -> KernelBuilder<'p> {
            let mut builder = Kernel::builder();
            builder.program(program).name(name).queue(self.queue.clone());
            unsafe {
                builder.disable_arg_type_check();
            }
            builder
        }
        /// The max work group size of `kernel` on the device.
        pub fn kernel_work_group_size(&self, kernel: &Kernel) -> Result<usize> {
            match kernel.wg_info(self.device, KernelWorkGroupInfo::WorkGroupSize)? {
                KernelWorkGroupInfoResult::WorkGroupSize(x) => Ok(x),
                x => bail!("Unexpected result {x:?} for WorkGroupSize!"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn config_defaults() {
        let config = Config::from_vars(vars(&[])).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn config_from_vars() {
        let config = Config::from_vars(vars(&[
            ("CLCONFORM_PLATFORM", "1"),
            ("CLCONFORM_DEVICE", " 2 "),
            ("CLCONFORM_SEED", "0xff"),
            ("CLCONFORM_IMAGE_SIZES", "small"),
        ]))
        .unwrap();
        assert_eq!(config.platform, 1);
        assert_eq!(config.device, 2);
        assert_eq!(config.seed, 255);
        assert_eq!(config.image_sizes, ImageSizeMode::Small);
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(serde_json::from_str::<Config>(&json).unwrap(), config);
    }

    #[test]
    fn config_invalid() {
        let e = Config::from_vars(vars(&[("CLCONFORM_DEVICE", "gpu")])).unwrap_err();
        let e = e.downcast::<InvalidConfig>().unwrap();
        assert_eq!(e.var, "CLCONFORM_DEVICE");
        assert!(Config::from_vars(vars(&[("CLCONFORM_SEED", "0xzz")])).is_err());
        assert!(Config::from_vars(vars(&[("CLCONFORM_IMAGE_SIZES", "huge")])).is_err());
    }

    #[test]
    fn config_rejects_zero_elements() {
        let e = Config::from_vars(vars(&[("CLCONFORM_NUM_ELEMENTS", "0")])).unwrap_err();
        let e = e.downcast::<InvalidConfig>().unwrap();
        assert_eq!(e.var, "CLCONFORM_NUM_ELEMENTS");
        let config = Config::from_vars(vars(&[("CLCONFORM_NUM_ELEMENTS", "1")])).unwrap();
        assert_eq!(config.num_elements, 1);
    }

    #[test]
    fn trial_results() {
        assert!(trial_result("a", Ok(TestOutcome::Pass)).is_ok());
        assert!(trial_result("a", Ok(TestOutcome::Skip)).is_ok());
        let failed = trial_result("integer_add_sat", Ok(TestOutcome::Fail)).unwrap_err();
        assert_eq!(failed.message(), Some("integer_add_sat failed"));
        let failed =
            trial_result("integer_add_sat", Err(anyhow::anyhow!("build failed"))).unwrap_err();
        assert_eq!(failed.message(), Some("integer_add_sat: build failed"));
    }

    #[test]
    fn case_outcomes() {
        assert_eq!(case_outcome("case", Ok(TestOutcome::Skip)), TestOutcome::Skip);
        assert_eq!(case_outcome("case", Ok(TestOutcome::Pass)), TestOutcome::Pass);
        assert_eq!(
            case_outcome("case", Err(anyhow::anyhow!("no kernel"))),
            TestOutcome::Fail
        );
    }

    #[test]
    fn extension_gated_tests() {
        let tests = registry();
        let extensions = "cl_khr_fp64 cl_khr_extended_async_copies";
        let supported: Vec<_> = tests
            .iter()
            .filter(|test| is_supported(test, extensions))
            .map(|test| test.name)
            .collect();
        assert_eq!(
            supported,
            [
                "async_copy_global_to_local3D",
                "async_copy_local_to_global3D",
                "integer_add_sat",
                "get_image_info_1D_buffer",
            ]
        );
        let ungated: Vec<_> = tests
            .iter()
            .filter(|test| is_supported(test, ""))
            .map(|test| test.name)
            .collect();
        assert_eq!(ungated, ["integer_add_sat", "get_image_info_1D_buffer"]);
    }

    #[test]
    fn outcome_combine() {
        use TestOutcome::*;
        assert_eq!(Pass.combine(Skip), Pass);
        assert_eq!(Skip.combine(Skip), Skip);
        assert_eq!(Pass.combine(Fail), Fail);
        assert_eq!([Skip, Pass, Skip].into_iter().collect::<TestOutcome>(), Pass);
        assert_eq!(std::iter::empty().collect::<TestOutcome>(), Skip);
    }

    #[test]
    fn extension_lookup_is_exact() {
        let extensions = "cl_khr_fp64 cl_khr_extended_async_copies  cl_khr_int64_base_atomics";
        assert!(has_extension(extensions, "cl_khr_extended_async_copies"));
        assert!(!has_extension(extensions, "cl_khr_int64"));
        assert!(!has_extension("", "cl_khr_fp64"));
    }

    #[test]
    fn data_gen_is_deterministic() {
        let a = DataGen::new(7).bytes(64);
        let b = DataGen::new(7).bytes(64);
        let c = DataGen::new(8).bytes(64);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(DataGen::new(1).words(10).len(), 10);
    }

    #[test]
    fn log_in_range_bounds() {
        let mut gen = DataGen::new(3);
        for _ in 0..1000 {
            let x = gen.log_in_range(16, 4096);
            assert!((16..=4096).contains(&x), "{x}");
        }
        assert_eq!(gen.log_in_range(5, 5), 5);
        assert_eq!(gen.log_in_range(9, 2), 9);
    }

    #[test]
    fn registry_names_are_unique() {
        let tests = registry();
        assert_eq!(tests.len(), 6);
        let mut names: Vec<_> = tests.iter().map(|x| x.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), tests.len());
    }
}
