// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Prints the `Cluster` custom resource definition as JSON, for installing
//! into a cluster alongside the operator.

use kube::CustomResourceExt;
use rds_resources::crd::cluster::v1alpha1::Cluster;

fn main() -> Result<(), anyhow::Error> {
    let crd = Cluster::crd();
    println!("{}", serde_json::to_string_pretty(&crd)?);
    Ok(())
}
