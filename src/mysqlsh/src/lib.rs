// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! MySQL Shell administration for InnoDB clusters.
//!
//! Group membership is changed exclusively through MySQL Shell's `dba`
//! Python API. This crate builds those invocations ([`Command`]), encodes
//! their option dictionaries ([`Options`]), decodes the cluster status
//! report ([`status::ClusterStatus`]), and runs them ([`AdminShell`]).

mod command;
mod options;
mod shell;
pub mod status;
#[cfg(any(test, feature = "test"))]
pub mod testing;

pub use command::Command;
pub use options::{OptionValue, Options};
pub use shell::{AdminShell, MySqlShell, ShellError};
