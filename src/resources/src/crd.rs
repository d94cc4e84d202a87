// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;

pub mod cluster;

/// An object that owns, and stamps its identity onto, the platform objects
/// generated from it.
pub trait ManagedResource: Resource<DynamicType = ()> + Sized {
    /// Labels applied to every object generated from this one.
    fn default_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Metadata for a generated object named `name`: same namespace, the
    /// default labels, and a controller owner reference back to `self` so
    /// that the platform garbage collects it along with its owner.
    fn managed_resource_meta(&self, name: String) -> ObjectMeta {
        ObjectMeta {
            namespace: self.meta().namespace.clone(),
            name: Some(name),
            labels: Some(self.default_labels()),
            owner_references: self.controller_owner_ref(&()).map(|owner| vec![owner]),
            ..Default::default()
        }
    }
}
