/*!
Conformance tests for OpenCL implementations.

Each test provisions OpenCL resources, runs generated kernels on the device
under test, and checks the results against a host reference.

Host-side reference logic is always available. The OpenCL backend is enabled
with the "device" feature.

```no_run
# use clconform::{harness::{registry, Config}, result::Result};
# fn main() -> Result<()> {
let config = Config::from_env()?;
for test in registry() {
    println!("{}", test.name);
}
# let _ = config;
# Ok(())
# }
```
*/
#![forbid(unsafe_op_in_unsafe_fn)]

pub use anyhow;

pub mod result {
    pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;
}

pub mod async_copy;
pub mod external_memory;
pub mod harness;
pub mod image;
pub mod integer_ops;
pub mod scalar;
