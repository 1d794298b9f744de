// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

/// The name of a policy object, e.g.
/// `/PolicyUniverse/PolicySpace/tenant0/GbpEpGroup/web/`.
#[derive(
    Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(transparent)]
pub struct Uri(String);

impl Uri {
    pub fn new<S: Into<String>>(s: S) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Uri {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Uri {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for Uri {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The class of a policy object, as carried by domain-update
/// notifications.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum ClassId {
    EndpointGroup,
    BridgeDomain,
    FloodDomain,
    RoutingDomain,
    Subnet,
    FloodContext,
    L3ExternalNetwork,
    L24Classifier,
    LocalExternalDomain,
    PlatformConfig,
}

impl Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::EndpointGroup => "EpGroup",
            Self::BridgeDomain => "BridgeDomain",
            Self::FloodDomain => "FloodDomain",
            Self::RoutingDomain => "RoutingDomain",
            Self::Subnet => "Subnet",
            Self::FloodContext => "FloodContext",
            Self::L3ExternalNetwork => "L3ExternalNetwork",
            Self::L24Classifier => "L24Classifier",
            Self::LocalExternalDomain => "LocalExternalDomain",
            Self::PlatformConfig => "PlatformConfig",
        };
        write!(f, "{s}")
    }
}
