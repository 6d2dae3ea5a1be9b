// This file is part of Nightjar, a security camera media pipeline.
// Copyright (C) 2022 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Logic for setting up a `tracing` subscriber according to our preferences.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Layer;

fn filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        .with_env_var("NIGHTJAR_LOG")
        .from_env_lossy()
}

/// Installs the global subscriber for the enclosing process: stderr writer,
/// thread names, `NIGHTJAR_LOG` filtering.
pub fn install() {
    let sub = tracing_subscriber::registry().with(
        tracing_subscriber::fmt::Layer::new()
            .with_writer(std::io::stderr)
            .with_thread_names(true)
            .with_filter(filter()),
    );
    tracing::subscriber::set_global_default(sub).expect("global subscriber already installed");
}

/// Installs a subscriber routing through the libtest capture mechanism.
/// Tolerates repeated calls so each test can invoke it.
pub fn install_for_tests() {
    let sub = tracing_subscriber::registry().with(
        tracing_subscriber::fmt::Layer::new()
            .with_test_writer()
            .with_thread_names(true)
            .with_filter(filter()),
    );
    let _ = tracing::subscriber::set_global_default(sub);
}
