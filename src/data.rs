//! Data structures for interaction data.

use rand::seq::SliceRandom;
use rand::Rng;

use super::{ItemId, UserId};

/// A single observed (user, item) interaction.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct Interaction {
    user_id: UserId,
    item_id: ItemId,
}

impl Interaction {
    /// Create a new interaction.
    pub fn new(user_id: UserId, item_id: ItemId) -> Self {
        Interaction { user_id, item_id }
    }

    /// Return the user index of the interaction.
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Return the item index of the interaction.
    pub fn item_id(&self) -> ItemId {
        self.item_id
    }
}

/// Randomly split interactions between training and test sets.
pub fn train_test_split<R: Rng>(
    interactions: &mut Interactions,
    rng: &mut R,
    test_fraction: f32,
) -> (Interactions, Interactions) {
    interactions.shuffle(rng);

    let (test, train) = interactions.split_at((test_fraction * interactions.len() as f32) as usize);

    (train, test)
}

/// A collection of observed interactions, together with the user and item
/// index bounds all of them fall within. Duplicate entries are permitted;
/// ordering is immaterial.
pub struct Interactions {
    num_users: usize,
    num_items: usize,
    interactions: Vec<Interaction>,
}

impl Interactions {
    /// Create an empty interaction set with the given index bounds.
    pub fn new(num_users: usize, num_items: usize) -> Self {
        Interactions {
            num_users,
            num_items,
            interactions: Vec::new(),
        }
    }

    /// Add an interaction.
    pub fn push(&mut self, interaction: Interaction) {
        self.interactions.push(interaction);
    }

    /// Return the underlying data.
    pub fn data(&self) -> &[Interaction] {
        &self.interactions
    }

    /// Give the number of contained interactions.
    pub fn len(&self) -> usize {
        self.interactions.len()
    }

    /// Check if there are no interactions.
    pub fn is_empty(&self) -> bool {
        self.interactions.is_empty()
    }

    /// Shuffle the interactions in random order.
    pub fn shuffle<R: Rng>(&mut self, rng: &mut R) {
        self.interactions.shuffle(rng);
    }

    /// Split interactions at `idx`.
    pub fn split_at(&self, idx: usize) -> (Self, Self) {
        let head = Interactions {
            num_users: self.num_users,
            num_items: self.num_items,
            interactions: self.interactions[..idx].to_owned(),
        };
        let tail = Interactions {
            num_users: self.num_users,
            num_items: self.num_items,
            interactions: self.interactions[idx..].to_owned(),
        };

        (head, tail)
    }

    /// Convert to a compressed per-user representation.
    pub fn to_compressed(&self) -> CompressedInteractions {
        CompressedInteractions::from(self)
    }

    /// Return the number of users in the dataset.
    pub fn num_users(&self) -> usize {
        self.num_users
    }

    /// Return the number of items in the dataset.
    pub fn num_items(&self) -> usize {
        self.num_items
    }

    /// Return the (`num_users`, `num_items`) tuple.
    pub fn shape(&self) -> (usize, usize) {
        (self.num_users, self.num_items)
    }
}

impl From<Vec<Interaction>> for Interactions {
    fn from(data: Vec<Interaction>) -> Interactions {
        let num_users = data.iter().map(|x| x.user_id()).max().map(|x| x + 1).unwrap_or(0);
        let num_items = data.iter().map(|x| x.item_id()).max().map(|x| x + 1).unwrap_or(0);

        Interactions {
            num_users,
            num_items,
            interactions: data,
        }
    }
}

/// A compressed adjacency-list representation of the items every user has
/// interacted with: an offset table into one contiguous arena of item
/// indices, with each user's slice sorted in ascending order so that
/// membership queries are a binary search.
#[derive(Clone, Debug)]
pub struct CompressedInteractions {
    num_users: usize,
    num_items: usize,
    user_pointers: Vec<usize>,
    item_ids: Vec<ItemId>,
}

impl<'a> From<&'a Interactions> for CompressedInteractions {
    fn from(interactions: &Interactions) -> CompressedInteractions {
        let mut data = interactions.data().to_owned();

        data.sort_by_key(|x| (x.user_id(), x.item_id()));

        let mut user_pointers = vec![0; interactions.num_users + 1];
        let mut item_ids = Vec::with_capacity(data.len());

        for datum in &data {
            item_ids.push(datum.item_id());

            user_pointers[datum.user_id() + 1] += 1;
        }

        for idx in 1..user_pointers.len() {
            user_pointers[idx] += user_pointers[idx - 1];
        }

        CompressedInteractions {
            num_users: interactions.num_users,
            num_items: interactions.num_items,
            user_pointers,
            item_ids,
        }
    }
}

impl CompressedInteractions {
    /// Iterate over users.
    pub fn iter_users(&self) -> CompressedInteractionsUserIterator {
        CompressedInteractionsUserIterator {
            interactions: self,
            idx: 0,
        }
    }

    /// Get a particular user's observed items.
    pub fn get_user(&self, user_id: UserId) -> Option<&[ItemId]> {
        if user_id >= self.num_users {
            return None;
        }

        let start = self.user_pointers[user_id];
        let stop = self.user_pointers[user_id + 1];

        Some(&self.item_ids[start..stop])
    }

    /// Check whether `user_id` has interacted with `item_id`.
    pub fn contains(&self, user_id: UserId, item_id: ItemId) -> bool {
        self.get_user(user_id)
            .map(|items| items.binary_search(&item_id).is_ok())
            .unwrap_or(false)
    }

    /// Return the number of users in the dataset.
    pub fn num_users(&self) -> usize {
        self.num_users
    }

    /// Return the number of items in the dataset.
    pub fn num_items(&self) -> usize {
        self.num_items
    }

    /// Return the (`num_users`, `num_items`) tuple.
    pub fn shape(&self) -> (usize, usize) {
        (self.num_users, self.num_items)
    }
}

/// Iterator over users in a compressed interaction dataset.
pub struct CompressedInteractionsUserIterator<'a> {
    interactions: &'a CompressedInteractions,
    idx: usize,
}

/// A single user's observed items in a compressed interaction dataset.
#[derive(Debug)]
pub struct CompressedInteractionsUser<'a> {
    /// The user index.
    pub user_id: UserId,
    /// The items the user has interacted with, sorted ascending.
    pub item_ids: &'a [ItemId],
}

impl<'a> Iterator for CompressedInteractionsUserIterator<'a> {
    type Item = CompressedInteractionsUser<'a>;
    fn next(&mut self) -> Option<Self::Item> {
        let value = if self.idx >= self.interactions.num_users {
            None
        } else {
            let start = self.interactions.user_pointers[self.idx];
            let stop = self.interactions.user_pointers[self.idx + 1];

            Some(CompressedInteractionsUser {
                user_id: self.idx,
                item_ids: &self.interactions.item_ids[start..stop],
            })
        };

        self.idx += 1;

        value
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_xorshift::XorShiftRng;

    use super::*;

    fn unsorted_interactions() -> Interactions {
        Interactions::from(vec![
            Interaction::new(1, 3),
            Interaction::new(0, 2),
            Interaction::new(0, 0),
            Interaction::new(1, 1),
            Interaction::new(0, 2),
        ])
    }

    #[test]
    fn compression_sorts_user_slices() {
        let compressed = unsorted_interactions().to_compressed();

        assert_eq!(compressed.shape(), (2, 4));
        assert_eq!(compressed.get_user(0), Some(&[0, 2, 2][..]));
        assert_eq!(compressed.get_user(1), Some(&[1, 3][..]));
        assert_eq!(compressed.get_user(2), None);
    }

    #[test]
    fn membership_queries() {
        let compressed = unsorted_interactions().to_compressed();

        assert!(compressed.contains(0, 2));
        assert!(!compressed.contains(0, 1));
        assert!(!compressed.contains(7, 0));
    }

    #[test]
    fn iteration_covers_every_user() {
        let mut interactions = Interactions::new(4, 3);
        interactions.push(Interaction::new(2, 1));

        let compressed = interactions.to_compressed();
        let users: Vec<_> = compressed.iter_users().collect();

        assert_eq!(users.len(), 4);
        assert!(users[0].item_ids.is_empty());
        assert_eq!(users[2].item_ids, &[1]);
    }

    #[test]
    fn split_preserves_all_interactions() {
        let mut interactions = unsorted_interactions();
        let mut rng = XorShiftRng::from_seed([42; 16]);

        let (train, test) = train_test_split(&mut interactions, &mut rng, 0.4);

        assert_eq!(train.len() + test.len(), interactions.len());
        assert_eq!(train.shape(), interactions.shape());
    }
}
