// Copyright the runsd Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;

use once_cell::sync::Lazy;

/// Cloud Run region name to the short code embedded in `*.a.run.app`
/// hostnames. The keyset is closed at build time: a region missing here is a
/// startup error on that region and a per-request error for cross-region
/// names.
static REGION_CODES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("asia-east1", "de"),
        ("asia-east2", "df"),
        ("asia-northeast1", "an"),
        ("asia-northeast2", "dt"),
        ("asia-northeast3", "du"),
        ("asia-south1", "el"),
        ("asia-south2", "em"),
        ("asia-southeast1", "as"),
        ("asia-southeast2", "et"),
        ("australia-southeast1", "ts"),
        ("australia-southeast2", "km"),
        ("europe-central2", "lm"),
        ("europe-north1", "lz"),
        ("europe-west1", "ew"),
        ("europe-west2", "nw"),
        ("europe-west3", "ey"),
        ("europe-west4", "ez"),
        ("europe-west6", "oa"),
        ("northamerica-northeast1", "nn"),
        ("southamerica-east1", "rj"),
        ("us-central1", "uc"),
        ("us-east1", "ue"),
        ("us-east4", "uk"),
        ("us-west1", "uw"),
        ("us-west2", "wl"),
        ("us-west3", "wm"),
        ("us-west4", "wn"),
    ])
});

/// Returns the URL code for a region, or `None` for a region this build does
/// not know about.
pub fn code(region: &str) -> Option<&'static str> {
    REGION_CODES.get(region).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_regions() {
        assert_eq!(Some("uc"), code("us-central1"));
        assert_eq!(Some("an"), code("asia-northeast1"));
    }

    #[test]
    fn unknown_region() {
        assert_eq!(None, code("mars-north1"));
        assert_eq!(None, code(""));
    }
}
