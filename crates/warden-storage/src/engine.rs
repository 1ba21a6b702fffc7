//! ---
//! warden_section: "03-persistence-storage"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Storage contract, permission engine and backends."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
//! Permission merge rules shared by every backend.
//!
//! A principal holds a right on a resource when its user entry, any of its
//! group entries or any of its role entries grants it. A request is granted
//! when every requested right is held; sources may differ per right.

use warden_model::{PermissionBits, PermissionMap, PermissionRequest, Principal, ResourcePermissions};

/// Effective bits of `principal`: per bit, OR over user, groups and roles.
pub fn effective_permissions(
    permissions: &ResourcePermissions,
    principal: &Principal,
) -> PermissionBits {
    let user = permissions
        .users
        .get(&principal.user_id)
        .copied()
        .unwrap_or_default();
    let groups = union_of(&permissions.groups, &principal.group_ids);
    let roles = union_of(&permissions.roles, &principal.role_ids);
    user.union(groups).union(roles)
}

fn union_of(entries: &PermissionMap, keys: &[String]) -> PermissionBits {
    keys.iter()
        .filter_map(|key| entries.get(key))
        .fold(PermissionBits::none(), |acc, bits| acc.union(*bits))
}

/// Whether `principal` satisfies every right in `request`.
pub fn is_granted(
    permissions: &ResourcePermissions,
    principal: &Principal,
    request: PermissionRequest,
) -> bool {
    request.is_satisfied_by(effective_permissions(permissions, principal))
}

/// Window over an ordered result; `limit == 0` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Page {
    pub const fn all() -> Self {
        Self {
            limit: 0,
            offset: 0,
        }
    }

    pub const fn new(limit: usize, offset: usize) -> Self {
        Self { limit, offset }
    }

    pub fn apply<T>(&self, items: impl IntoIterator<Item = T>) -> Vec<T> {
        let iter = items.into_iter().skip(self.offset);
        if self.limit == 0 {
            iter.collect()
        } else {
            iter.take(self.limit).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_model::Right;

    fn bits_from_mask(mask: u8) -> PermissionBits {
        let mut bits = PermissionBits::none();
        for (index, right) in Right::ALL.iter().enumerate() {
            bits.set(*right, mask & (1 << index) != 0);
        }
        bits
    }

    /// Every combination of user/group/role bits against every request.
    #[test]
    fn merge_matches_per_bit_or_and_all_of() {
        let principal = Principal::user("u1")
            .with_groups(["g1", "g2"])
            .with_roles(["r1"]);
        for user_mask in 0..16u8 {
            for group_mask in 0..16u8 {
                for role_mask in 0..16u8 {
                    let permissions = ResourcePermissions::new()
                        .with_user("u1", bits_from_mask(user_mask))
                        .with_user("u2", PermissionBits::all())
                        .with_group("g2", bits_from_mask(group_mask))
                        .with_group("g9", PermissionBits::all())
                        .with_role("r1", bits_from_mask(role_mask));
                    for request_mask in 1..16u8 {
                        let request = PermissionRequest::new(bits_from_mask(request_mask)).unwrap();
                        let expected = Right::ALL.iter().enumerate().all(|(index, _)| {
                            let bit = 1 << index;
                            request_mask & bit == 0
                                || user_mask & bit != 0
                                || group_mask & bit != 0
                                || role_mask & bit != 0
                        });
                        assert_eq!(
                            is_granted(&permissions, &principal, request),
                            expected,
                            "user={user_mask} group={group_mask} role={role_mask} request={request_mask}"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn rights_may_come_from_different_sources() {
        let permissions = ResourcePermissions::new()
            .with_user("u1", "r".parse().unwrap())
            .with_group("g1", "w".parse().unwrap())
            .with_role("ops", "x".parse().unwrap());
        let principal = Principal::user("u1").with_groups(["g1"]).with_roles(["ops"]);
        assert!(is_granted(&permissions, &principal, "rwx".parse().unwrap()));
        assert!(!is_granted(&permissions, &principal, "rwxa".parse().unwrap()));
        let stranger = Principal::user("u2").with_groups(["g1"]);
        assert!(!is_granted(&permissions, &stranger, "rw".parse().unwrap()));
    }

    #[test]
    fn page_windows_concatenate_to_full_list() {
        let items: Vec<u32> = (0..23).collect();
        let mut collected = Vec::new();
        let mut offset = 0;
        loop {
            let window = Page::new(5, offset).apply(items.clone());
            if window.is_empty() {
                break;
            }
            collected.extend(window);
            offset += 5;
        }
        assert_eq!(collected, items);
        assert_eq!(Page::all().apply(items.clone()), items);
        assert!(Page::new(3, 40).apply(items).is_empty());
    }
}
