use aero_snapshot::Snapshot;
use proptest::prelude::*;

proptest! {
    #[test]
    fn arbitrary_field_sets_round_trip_through_encode_decode(
        fields in proptest::collection::vec(
            (
                "[a-z]{1,8}",
                "[a-z]{1,8}",
                proptest::collection::vec(any::<u8>(), 0..64),
            ),
            0..16,
        )
    ) {
        let mut snap = Snapshot::new();
        for (object, field, bytes) in &fields {
            snap.push(object, field, bytes);
        }
        let blob = snap.encode();
        let back = Snapshot::decode(&blob).unwrap();

        prop_assert_eq!(back.fields().len(), fields.len());
        for (got, (object, field, bytes)) in back.fields().iter().zip(fields.iter()) {
            prop_assert_eq!(&got.object, object);
            prop_assert_eq!(&got.field, field);
            prop_assert_eq!(&got.bytes, bytes);
        }
    }
}
