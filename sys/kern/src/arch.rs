// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here
//! in the `arch` module, magically tailored for the current target. For
//! this to work, each support module must define the same set of names.
//!
//! Two ports exist: `arm_m` does real work on M-profile targets, and `fake`
//! satisfies the interface on the development host so the rest of the
//! kernel can be unit-tested without a context switch ever happening.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "arm")] {
        #[macro_use]
        pub mod arm_m;
        pub use arm_m::*;
    } else {
        #[macro_use]
        pub mod fake;
        pub use fake::*;
    }
}
