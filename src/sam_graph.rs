//! Social Graph Generator
//!
//! Splits the client population into groups and builds the weighted friend
//! relation clients pick their message recipients from.
//!
//! Within a group every member is friends with every other member; how often
//! a member gets picked is skewed by a Dirichlet-distributed weight vector.
//! Each group also nominates one boundary contact (its heaviest member) and
//! the boundary contacts are paired up in a ring over the groups, so every
//! group has at least one friendship leaving it.

use crate::sam_error::ConfigError;
use crate::sam_interface::{derive_rng, ClientId, GroupId, Seed};
use crate::sam_scenario::Scenario;
use indexmap::IndexMap;
use log::{info, warn};
use rand_distr::{Dirichlet, Distribution};
use std::collections::BTreeSet;

/// A group of clients that mostly talk among themselves
#[derive(Clone, Debug, PartialEq)]
pub struct Group {
    pub id: GroupId,
    pub members: Vec<ClientId>,
    /// Dirichlet weight of each member, same order as `members`
    pub weights: Vec<f64>,
    /// Member that carries the group's inter-group friendship
    pub boundary: ClientId,
}

/// Directed friendship; `to` is a valid recipient for `from`
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct FriendEdge {
    pub from: ClientId,
    pub to: ClientId,
    pub weight: f64,
    pub inter_group: bool,
}

/// Groups plus friend edges, immutable once generated
#[derive(Clone, Debug)]
pub struct SocialGraph {
    groups: Vec<Group>,
    edges: Vec<FriendEdge>,
    membership: Vec<GroupId>,
    friends: Vec<IndexMap<ClientId, f64>>,
}

/// Split `clients` into groups by `fractions` using largest-remainder rounding.
///
/// Ties between equal remainders go to the lower group index. Fails when a
/// group would end up empty.
pub fn apportion(clients: usize, fractions: &[f64]) -> Result<Vec<usize>, ConfigError> {
    let ideal: Vec<f64> = fractions.iter().map(|f| clients as f64 * f).collect();
    let mut sizes: Vec<usize> = ideal.iter().map(|x| x.floor() as usize).collect();

    let mut by_remainder: Vec<usize> = (0..fractions.len()).collect();
    by_remainder.sort_by(|&a, &b| {
        let ra = ideal[a] - ideal[a].floor();
        let rb = ideal[b] - ideal[b].floor();
        rb.total_cmp(&ra).then(a.cmp(&b))
    });

    let assigned: usize = sizes.iter().sum();
    if assigned < clients {
        for &idx in by_remainder.iter().cycle().take(clients - assigned) {
            sizes[idx] += 1;
        }
    } else {
        // only reachable when the fractions overshoot 1 by rounding error
        for &idx in by_remainder.iter().rev().cycle().take(assigned - clients) {
            sizes[idx] = sizes[idx].saturating_sub(1);
        }
    }

    if let Some(group) = sizes.iter().position(|&s| s == 0) {
        return Err(ConfigError::EmptyGroup { group, clients });
    }

    Ok(sizes)
}

/// Sample Dirichlet(alpha, .., alpha) weights for a group of `size` members
fn sample_weights(size: usize, alpha: f64, seed: &Seed, group: GroupId) -> Result<Vec<f64>, ConfigError> {
    if size == 1 {
        return Ok(vec![1.0]);
    }

    let mut rng = derive_rng(seed, "group", group);
    let dirichlet = Dirichlet::new_with_size(alpha, size).map_err(|_| ConfigError::NotPositive {
        field: "friendAlpha",
        value: alpha,
    })?;
    let weights: Vec<f64> = dirichlet.sample(&mut rng);

    // a tiny alpha can underflow every gamma draw
    let sum: f64 = weights.iter().sum();
    if weights.iter().all(|w| w.is_finite()) && sum > 0.0 {
        Ok(weights)
    } else {
        warn!(
            "group {}: degenerate friend weights for alpha {}, using uniform",
            group, alpha
        );
        Ok(vec![1.0 / size as f64; size])
    }
}

/// Member with the highest weight, lowest client id on ties
fn heaviest_member(members: &[ClientId], weights: &[f64]) -> ClientId {
    members
        .iter()
        .zip(weights)
        .fold(None, |best: Option<(ClientId, f64)>, (&id, &w)| match best {
            Some((_, bw)) if bw >= w => best,
            _ => Some((id, w)),
        })
        .map(|(id, _)| id)
        .unwrap_or_default()
}

impl SocialGraph {
    /// Generate groups and friend edges for a scenario.
    ///
    /// Clients are numbered `0..clients` and assigned to groups in order. The
    /// result only depends on the scenario and `seed`.
    pub fn generate(scenario: &Scenario, seed: &Seed) -> Result<Self, ConfigError> {
        let sizes = apportion(scenario.clients, &scenario.group_fractions())?;

        let mut groups = Vec::with_capacity(sizes.len());
        let mut membership = Vec::with_capacity(scenario.clients);
        let mut next: ClientId = 0;

        for (idx, &size) in sizes.iter().enumerate() {
            let id = idx as GroupId;
            let members: Vec<ClientId> = (next..next + size as ClientId).collect();
            next += size as ClientId;

            let weights = sample_weights(size, scenario.friend_alpha, seed, id)?;
            let boundary = heaviest_member(&members, &weights);
            membership.extend(std::iter::repeat(id).take(size));

            groups.push(Group {
                id,
                members,
                weights,
                boundary,
            });
        }

        let mut edges = Vec::new();

        // intra-group: everybody knows everybody, weighted by the target's share
        for group in &groups {
            for &from in &group.members {
                for (&to, &weight) in group.members.iter().zip(&group.weights) {
                    if from != to {
                        edges.push(FriendEdge {
                            from,
                            to,
                            weight,
                            inter_group: false,
                        });
                    }
                }
            }
        }

        // inter-group: ring over the boundary contacts
        let mut pairs = BTreeSet::new();
        if groups.len() > 1 {
            for (idx, group) in groups.iter().enumerate() {
                let other = &groups[(idx + 1) % groups.len()];
                let pair = (group.boundary.min(other.boundary), group.boundary.max(other.boundary));
                pairs.insert(pair);
            }
        }
        let weight_of = |client: ClientId| -> f64 {
            let group = &groups[membership[client as usize] as usize];
            group
                .members
                .iter()
                .position(|&m| m == client)
                .map(|pos| group.weights[pos])
                .unwrap_or(0.0)
        };
        for &(a, b) in &pairs {
            edges.push(FriendEdge {
                from: a,
                to: b,
                weight: weight_of(b),
                inter_group: true,
            });
            edges.push(FriendEdge {
                from: b,
                to: a,
                weight: weight_of(a),
                inter_group: true,
            });
        }

        let mut friends: Vec<IndexMap<ClientId, f64>> = vec![IndexMap::new(); scenario.clients];
        for edge in &edges {
            friends[edge.from as usize].insert(edge.to, edge.weight);
        }

        for (client, f) in friends.iter().enumerate() {
            if f.is_empty() {
                warn!("client {} has no friends and will never send", client);
            }
        }

        info!(
            "social graph: {} clients, {} groups {:?}, {} edges ({} inter-group)",
            scenario.clients,
            groups.len(),
            sizes,
            edges.len(),
            pairs.len() * 2
        );

        Ok(Self {
            groups,
            edges,
            membership,
            friends,
        })
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn edges(&self) -> &[FriendEdge] {
        &self.edges
    }

    pub fn client_count(&self) -> usize {
        self.membership.len()
    }

    pub fn group_of(&self, client: ClientId) -> Option<GroupId> {
        self.membership.get(client as usize).copied()
    }

    /// Whether two clients sit in different groups
    pub fn is_inter_group(&self, a: ClientId, b: ClientId) -> bool {
        self.group_of(a) != self.group_of(b)
    }

    /// Friends of a client with their raw weights, in edge order
    pub fn friends_of(&self, client: ClientId) -> Option<&IndexMap<ClientId, f64>> {
        self.friends.get(client as usize)
    }

    /// Friend weights of a client normalized to add up to 1
    pub fn friend_frequencies(&self, client: ClientId) -> Vec<(ClientId, f64)> {
        let Some(friends) = self.friends_of(client) else {
            return Vec::new();
        };
        let total: f64 = friends.values().sum();
        if total <= 0.0 {
            let uniform = 1.0 / friends.len().max(1) as f64;
            return friends.keys().map(|&f| (f, uniform)).collect();
        }
        friends.iter().map(|(&f, &w)| (f, w / total)).collect()
    }
}
