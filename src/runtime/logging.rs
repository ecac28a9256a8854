// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::flexi_logger::Logger;
use ::std::sync::Once;

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Guardian to the logging initialize function.
static INIT_LOG: Once = Once::new();

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Initializes logging features. Safe to call more than once; only the
/// first call has an effect. The log specification is read from the
/// environment (`RUST_LOG`) and defaults to `warn`.
pub fn initialize() {
    INIT_LOG.call_once(|| {
        if let Ok(logger) = Logger::try_with_env_or_str("warn") {
            // A logger installed by the embedding application wins.
            let _ = logger.start();
        }
    });
}
