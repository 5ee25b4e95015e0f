// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

/// Initializes logging for a test binary; repeated calls are harmless.
#[allow(dead_code)]
pub fn init() {
    let _ = flexi_logger::Logger::try_with_env_or_str("warn").map(|logger| logger.start());
}
