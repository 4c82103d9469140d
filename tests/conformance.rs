use clconform::harness::{self, Config};
use libtest_mimic::{Arguments, Trial};

fn main() {
    let args = Arguments::from_args();
    let config = Config::from_env().unwrap();
    println!("config: {}", serde_json::to_string(&config).unwrap());
    let mut tests = harness::host_trials();
    tests.push(Trial::test("registry_host", || {
        let names: Vec<_> = harness::registry().iter().map(|x| x.name).collect();
        assert_eq!(
            names,
            [
                "async_copy_global_to_local3D",
                "async_copy_local_to_global3D",
                "integer_add_sat",
                "get_image_info_1D_buffer",
                "external_memory_ahb_images",
                "external_memory_ahb_blob",
            ]
        );
        Ok(())
    }));
    #[cfg(feature = "device")]
    {
        use std::sync::Arc;

        println!("testing platform {} device {}", config.platform, config.device);
        let ctx = Arc::new(harness::TestContext::new(config).unwrap());
        tests.extend(harness::device_trials(&ctx).unwrap());
    }
    libtest_mimic::run(&args, tests).exit()
}
