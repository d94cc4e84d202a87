// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The agent that runs beside every MySQL instance of a cluster.
//!
//! The agent owns its instance's group membership: it creates, joins or
//! rejoins the InnoDB cluster through MySQL Shell, gates the instance's
//! readiness on being an online member, and publishes the outcome on its
//! pod for the operator to label roles and judge cluster readiness.

pub mod health;
pub mod instance;
pub mod manager;
pub mod metrics;
pub mod registry;
