//! Order book reconstruction from the slab arena.
//!
//! A small builder lays leaves and inner nodes into a zeroed book side
//! account; the tests decode it and check sorting, expiry, and depth queries.

use perp_snapshot::{
    config::BookQuery,
    constants::{BOOK_SIDE_HEADER_LEN, BOOK_SIDE_LEN, NIL, NODE_SIZE},
    error::DecodeError,
    slab::{ImpactPrice, NodeTag, OrderBookSide, OrderType, PriceLevel, SlabNode},
    state::{DataType, Side},
};
use solana_program::pubkey::Pubkey;

// --- Builders ---

#[derive(Clone)]
struct LeafFixture {
    price: i64,
    quantity: i64,
    seq: u64,
    timestamp: u64,
    time_in_force: u8,
    order_type: OrderType,
    owner: Pubkey,
}

fn leaf(price: i64, quantity: i64) -> LeafFixture {
    LeafFixture {
        price,
        quantity,
        seq: 0,
        timestamp: 1_000,
        time_in_force: 0,
        order_type: OrderType::Limit,
        owner: Pubkey::default(),
    }
}

impl LeafFixture {
    fn expiring(mut self, timestamp: u64, tif: u8) -> Self {
        self.timestamp = timestamp;
        self.time_in_force = tif;
        self
    }
}

fn order_key(side: Side, price: i64, seq: u64) -> i128 {
    let low = match side {
        Side::Bid => !seq,
        Side::Ask => seq,
    };
    ((price as i128) << 64) | low as i128
}

struct BookBuilder {
    data: Vec<u8>,
    side: Side,
}

impl BookBuilder {
    fn new(side: Side) -> Self {
        let mut data = vec![0u8; BOOK_SIDE_LEN];
        data[0] = match side {
            Side::Bid => DataType::Bids as u8,
            Side::Ask => DataType::Asks as u8,
        };
        data[2] = 1;
        let mut b = Self { data, side };
        b.set_root(NIL);
        b.set_free_head(NIL);
        b
    }

    fn slot(&mut self, index: usize) -> &mut [u8] {
        let start = BOOK_SIDE_HEADER_LEN + index * NODE_SIZE;
        &mut self.data[start..start + NODE_SIZE]
    }

    fn put_leaf(&mut self, index: usize, fixture: &LeafFixture) {
        let key = order_key(self.side, fixture.price, fixture.seq);
        let s = self.slot(index);
        s[0..4].copy_from_slice(&(NodeTag::LeafNode as u32).to_le_bytes());
        s[4] = index as u8;
        s[5] = fixture.order_type as u8;
        s[6] = 1;
        s[7] = fixture.time_in_force;
        s[8..24].copy_from_slice(&key.to_le_bytes());
        s[24..56].copy_from_slice(fixture.owner.as_ref());
        s[56..64].copy_from_slice(&fixture.quantity.to_le_bytes());
        s[64..72].copy_from_slice(&(fixture.seq + 500).to_le_bytes());
        s[72..80].copy_from_slice(&fixture.price.to_le_bytes());
        s[80..88].copy_from_slice(&fixture.timestamp.to_le_bytes());
    }

    fn put_inner(&mut self, index: usize, children: [u32; 2]) {
        let s = self.slot(index);
        s[0..4].copy_from_slice(&(NodeTag::InnerNode as u32).to_le_bytes());
        s[4..8].copy_from_slice(&64u32.to_le_bytes());
        s[24..28].copy_from_slice(&children[0].to_le_bytes());
        s[28..32].copy_from_slice(&children[1].to_le_bytes());
    }

    fn put_tag(&mut self, index: usize, tag: u32) {
        self.slot(index)[0..4].copy_from_slice(&tag.to_le_bytes());
    }

    fn set_root(&mut self, root: u32) {
        self.data[28..32].copy_from_slice(&root.to_le_bytes());
    }

    fn set_leaf_count(&mut self, n: u64) {
        self.data[32..40].copy_from_slice(&n.to_le_bytes());
    }

    fn set_free_head(&mut self, head: u32) {
        self.data[24..28].copy_from_slice(&head.to_le_bytes());
    }

    fn set_free_len(&mut self, n: u64) {
        self.data[16..24].copy_from_slice(&n.to_le_bytes());
    }

    /// Leaves go to slots 0..n in the given order; inner nodes follow and
    /// chain them into a right-leaning tree.
    fn with_tree(mut self, leaves: &[LeafFixture]) -> Self {
        for (i, fixture) in leaves.iter().enumerate() {
            let mut fixture = fixture.clone();
            fixture.seq = i as u64;
            self.put_leaf(i, &fixture);
        }
        let n = leaves.len();
        if n == 1 {
            self.set_root(0);
        } else if n > 1 {
            let first_inner = n;
            for k in 0..n - 1 {
                let right = if k == n - 2 { (n - 1) as u32 } else { (first_inner + k + 1) as u32 };
                self.put_inner(first_inner + k, [k as u32, right]);
            }
            self.set_root(first_inner as u32);
        }
        self.set_leaf_count(n as u64);
        let bump = if n > 1 { 2 * n - 1 } else { n };
        self.data[8..16].copy_from_slice(&(bump as u64).to_le_bytes());
        self
    }

    fn decode(&self) -> OrderBookSide {
        OrderBookSide::decode(&self.data).unwrap()
    }
}

fn prices(book: &OrderBookSide, query: &BookQuery) -> Vec<i64> {
    book.orders(query).iter().map(|o| o.price).collect()
}

// --- Decode ---

#[test]
fn empty_book_decodes_and_has_no_best() {
    let book = BookBuilder::new(Side::Ask).decode();
    assert_eq!(book.side, Side::Ask);
    assert_eq!(book.nodes.len(), 1024);
    assert!(book.nodes.iter().all(|n| *n == SlabNode::Uninitialized));
    assert_eq!(book.best(&BookQuery::default()), None);
    assert_eq!(book.impact_price(1, &BookQuery::default()), ImpactPrice::InsufficientDepth);
    book.verify().unwrap();
}

#[test]
fn side_follows_data_type() {
    let book = BookBuilder::new(Side::Bid).with_tree(&[leaf(5, 1)]).decode();
    assert_eq!(book.side, Side::Bid);
    assert_eq!(book.meta.data_type, DataType::Bids);
}

#[test]
fn leaf_fields_are_copied_into_orders() {
    let owner = Pubkey::new_unique();
    let mut fixture = leaf(-3, 42).expiring(1_700, 30);
    fixture.owner = owner;
    fixture.order_type = OrderType::PostOnly;
    let book = BookBuilder::new(Side::Ask).with_tree(&[leaf(1, 1), fixture]).decode();

    let orders = book.orders(&BookQuery::including_expired(0)).into_vec();
    let order = &orders[0];
    assert_eq!(order.price, -3);
    assert_eq!(order.quantity, 42);
    assert_eq!(order.owner, owner);
    assert_eq!(order.owner_slot, 1);
    assert_eq!(order.order_type, OrderType::PostOnly);
    assert_eq!(order.client_order_id, 501);
    assert_eq!(order.best_initial, -3);
    assert_eq!(order.timestamp, 1_700);
    assert_eq!(order.time_in_force, 30);
    assert_eq!(order.expiry, Some(1_730));
    assert_eq!(order.arena_index, 1);
    assert_eq!(order.seq_num(), 1);
    assert_eq!(order.order_id, order_key(Side::Ask, -3, 1));
}

#[test]
fn bid_seq_num_is_recovered_from_inverted_key() {
    let book = BookBuilder::new(Side::Bid).with_tree(&[leaf(10, 1), leaf(10, 1), leaf(10, 1)]).decode();
    let seqs: Vec<u64> = book.orders(&BookQuery::default()).iter().map(|o| o.seq_num()).collect();
    assert_eq!(seqs, vec![0, 1, 2]);
}

#[test]
fn unknown_node_tag_is_fatal() {
    let mut b = BookBuilder::new(Side::Ask).with_tree(&[leaf(1, 1)]);
    b.put_tag(700, 9);
    assert_eq!(
        OrderBookSide::decode(&b.data),
        Err(DecodeError::UnknownDiscriminator { kind: "node", value: 9 })
    );
}

#[test]
fn unknown_order_type_is_fatal() {
    let mut b = BookBuilder::new(Side::Ask).with_tree(&[leaf(1, 1)]);
    b.slot(0)[5] = 17;
    assert_eq!(
        OrderBookSide::decode(&b.data),
        Err(DecodeError::UnknownDiscriminator { kind: "order type", value: 17 })
    );
}

#[test]
fn slab_node_rejects_wrong_slot_size() {
    assert!(matches!(SlabNode::decode(&[0u8; 87]), Err(DecodeError::LengthMismatch { .. })));
    assert_eq!(SlabNode::decode(&[0u8; 88]), Ok(SlabNode::Uninitialized));
}

// --- Sorting ---

#[test]
fn asks_sort_ascending_bids_descending() {
    let resting = [leaf(103, 1), leaf(100, 1), leaf(105, 1), leaf(101, 1)];
    let asks = BookBuilder::new(Side::Ask).with_tree(&resting).decode();
    let bids = BookBuilder::new(Side::Bid).with_tree(&resting).decode();
    let q = BookQuery::default();

    assert_eq!(prices(&asks, &q), vec![100, 101, 103, 105]);
    assert_eq!(prices(&bids, &q), vec![105, 103, 101, 100]);
    assert_eq!(asks.best(&q).unwrap().price, 100);
    assert_eq!(bids.best(&q).unwrap().price, 105);
}

#[test]
fn equal_prices_keep_arena_order() {
    let resting = [leaf(100, 1), leaf(99, 2), leaf(100, 3), leaf(100, 4)];
    let bids = BookBuilder::new(Side::Bid).with_tree(&resting).decode();
    let indices: Vec<u32> = bids.orders(&BookQuery::default()).iter().map(|o| o.arena_index).collect();
    assert_eq!(indices, vec![0, 2, 3, 1]);
}

#[test]
fn orders_come_from_every_arena_slot() {
    // leaf at slot 900 is not linked into the tree but is still a live leaf
    let mut b = BookBuilder::new(Side::Ask).with_tree(&[leaf(10, 1)]);
    b.put_leaf(900, &leaf(7, 1));
    let book = b.decode();
    assert_eq!(prices(&book, &BookQuery::default()), vec![7, 10]);
    assert!(book.verify().is_err());
}

#[test]
fn free_slots_are_not_orders() {
    let mut b = BookBuilder::new(Side::Ask).with_tree(&[leaf(10, 1), leaf(11, 1)]);
    b.put_tag(5, NodeTag::FreeNode as u32);
    b.put_tag(6, NodeTag::LastFreeNode as u32);
    b.set_free_head(5);
    b.set_free_len(2);
    let book = b.decode();

    assert_eq!(book.nodes[5], SlabNode::Free);
    assert_eq!(book.nodes[6], SlabNode::LastFree);
    assert_eq!(book.orders(&BookQuery::default()).len(), 2);
    book.verify().unwrap();
}

// --- Expiry ---

#[test]
fn zero_time_in_force_never_expires() {
    let book = BookBuilder::new(Side::Ask).with_tree(&[leaf(1, 1).expiring(10, 0)]).decode();
    for now in [0, 10, 11, u64::MAX] {
        assert_eq!(book.orders(&BookQuery::at(now)).len(), 1, "now = {}", now);
    }
}

#[test]
fn orders_expire_at_timestamp_plus_tif() {
    let book = BookBuilder::new(Side::Ask).with_tree(&[leaf(1, 1).expiring(1_000, 20)]).decode();
    assert_eq!(book.orders(&BookQuery::at(1_019)).len(), 1);
    assert_eq!(book.orders(&BookQuery::at(1_020)).len(), 0);
    assert_eq!(book.orders(&BookQuery::at(5_000)).len(), 0);
    assert_eq!(book.orders(&BookQuery::including_expired(5_000)).len(), 1);
}

#[test]
fn expiry_saturates_near_u64_max() {
    let book = BookBuilder::new(Side::Ask).with_tree(&[leaf(1, 1).expiring(u64::MAX - 1, 200)]).decode();
    let order = &book.orders(&BookQuery::including_expired(0)).into_vec()[0];
    assert_eq!(order.expiry, Some(u64::MAX));
    assert!(!order.is_expired(u64::MAX - 1));
    assert!(order.is_expired(u64::MAX));
}

#[test]
fn expired_best_is_skipped() {
    let resting = [leaf(100, 1).expiring(0, 5), leaf(101, 1)];
    let asks = BookBuilder::new(Side::Ask).with_tree(&resting).decode();
    assert_eq!(asks.best(&BookQuery::at(10)).unwrap().price, 101);
    assert_eq!(asks.best(&BookQuery::at(4)).unwrap().price, 100);
}

// --- Depth ---

#[test]
fn impact_price_needs_strictly_more_quantity() {
    let asks = BookBuilder::new(Side::Ask)
        .with_tree(&[leaf(102, 30), leaf(100, 10), leaf(101, 20)])
        .decode();
    let orders = asks.orders(&BookQuery::default());

    assert_eq!(orders.impact_price(25), ImpactPrice::Price(101));
    assert_eq!(orders.impact_price(9), ImpactPrice::Price(100));
    assert_eq!(orders.impact_price(10), ImpactPrice::Price(101));
    assert_eq!(orders.impact_price(59), ImpactPrice::Price(102));
    assert_eq!(orders.impact_price(60), ImpactPrice::InsufficientDepth);
    assert_eq!(orders.impact_price(1000), ImpactPrice::InsufficientDepth);
    assert_eq!(orders.impact_price(1000).price(), None);
}

#[test]
fn impact_price_does_not_confuse_zero_price_with_missing_depth() {
    let bids = BookBuilder::new(Side::Bid).with_tree(&[leaf(0, 5)]).decode();
    assert_eq!(bids.impact_price(1, &BookQuery::default()), ImpactPrice::Price(0));
    assert_eq!(bids.impact_price(5, &BookQuery::default()), ImpactPrice::InsufficientDepth);
}

#[test]
fn levels_aggregate_same_price_orders() {
    let resting = [leaf(100, 1), leaf(101, 2), leaf(100, 3), leaf(102, 4), leaf(101, 5)];
    let asks = BookBuilder::new(Side::Ask).with_tree(&resting).decode();
    let orders = asks.orders(&BookQuery::default());

    assert_eq!(
        orders.levels(2),
        vec![
            PriceLevel { price: 100, quantity: 4, orders: 2 },
            PriceLevel { price: 101, quantity: 7, orders: 2 },
        ]
    );
    assert_eq!(orders.levels(10).len(), 3);
    assert!(orders.levels(0).is_empty());
}

// --- Verification ---

#[test]
fn well_formed_tree_verifies() {
    let resting: Vec<LeafFixture> = (0..20).map(|i| leaf(100 + i, 1)).collect();
    let book = BookBuilder::new(Side::Bid).with_tree(&resting).decode();
    book.verify().unwrap();
    assert_eq!(book.leaf_count, 20);
    assert_eq!(book.bump_index, 39);
}

#[test]
fn verify_catches_leaf_count_mismatch() {
    let mut b = BookBuilder::new(Side::Ask).with_tree(&[leaf(1, 1), leaf(2, 1)]);
    b.set_leaf_count(3);
    assert!(matches!(b.decode().verify(), Err(DecodeError::MalformedTree { .. })));
}

#[test]
fn verify_catches_child_outside_arena() {
    let mut b = BookBuilder::new(Side::Ask).with_tree(&[leaf(1, 1), leaf(2, 1)]);
    b.put_inner(2, [0, 5_000]);
    assert_eq!(
        b.decode().verify(),
        Err(DecodeError::MalformedTree { index: 5_000, reason: "child index outside arena" })
    );
}

#[test]
fn verify_catches_cycles() {
    let mut b = BookBuilder::new(Side::Ask).with_tree(&[leaf(1, 1), leaf(2, 1)]);
    b.put_inner(2, [0, 2]);
    assert_eq!(
        b.decode().verify(),
        Err(DecodeError::MalformedTree { index: 2, reason: "node reachable twice" })
    );
}

#[test]
fn verify_catches_free_list_mismatch() {
    let mut b = BookBuilder::new(Side::Ask).with_tree(&[leaf(1, 1)]);
    b.put_tag(10, NodeTag::LastFreeNode as u32);
    b.set_free_len(1);
    b.set_free_head(11);
    assert!(matches!(
        b.decode().verify(),
        Err(DecodeError::MalformedTree { reason: "free list head is not a free slot", .. })
    ));

    b.set_free_len(2);
    assert!(matches!(
        b.decode().verify(),
        Err(DecodeError::MalformedTree { reason: "free slots differ from free list length", .. })
    ));
}

#[test]
fn book_query_loads_from_json() {
    let q: BookQuery = serde_json::from_str(r#"{"now": 1650000000, "includeExpired": true}"#).unwrap();
    assert_eq!(q, BookQuery::including_expired(1_650_000_000));

    let q: BookQuery = serde_json::from_str("{}").unwrap();
    assert_eq!(q, BookQuery::default());
}
