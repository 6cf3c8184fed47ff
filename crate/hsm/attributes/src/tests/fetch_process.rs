use pkcs11_sys::{
    CK_ATTRIBUTE_TYPE, CKA_CLASS, CKA_ID, CKA_LABEL, CKA_MODULUS, CKA_PRIME_1,
    CKA_PRIVATE_EXPONENT, CKA_TOKEN, CKA_VALUE, CKR_BUFFER_TOO_SMALL, CKR_OBJECT_HANDLE_INVALID,
};

use super::{
    log_init,
    mock_device::{MockToken, OBJECT, SESSION},
};
use crate::{
    AmbiguityPolicy, AttributeDevice, AttributeLengthStrategy, AttributeValue, FetchMode,
    FetchedAttribute, FixedClassStrategy, GetAttributeProcess, HError, HResult,
    InstrumentedDevice, DEFAULT_ATTRIBUTE_LENGTH, DEFAULT_LARGE_ATTRIBUTE_LENGTH,
};

const CLASS_BYTES: [u8; 8] = [0, 0, 0, 0, 0, 0, 0, 0];

/// Run a complete fetch and return the results with the number of rounds
fn fetch<D: AttributeDevice>(
    device: &D,
    strategy: &AttributeLengthStrategy,
    mode: FetchMode,
    policy: AmbiguityPolicy,
    attribute_types: &[CK_ATTRIBUTE_TYPE],
) -> HResult<(Vec<FetchedAttribute>, usize)> {
    let mut process = GetAttributeProcess::new(device, SESSION, OBJECT, strategy, mode)
        .with_ambiguity_policy(policy);
    let attributes = process.fetch(attribute_types)?;
    Ok((attributes, process.rounds()))
}

fn fetch_batch<D: AttributeDevice>(
    device: &D,
    strategy: &AttributeLengthStrategy,
    attribute_types: &[CK_ATTRIBUTE_TYPE],
) -> HResult<(Vec<FetchedAttribute>, usize)> {
    fetch(
        device,
        strategy,
        FetchMode::Batch,
        AmbiguityPolicy::default(),
        attribute_types,
    )
}

/// A strategy guessing the default length for every attribute
fn small_guesses() -> AttributeLengthStrategy {
    AttributeLengthStrategy::FixedClass(FixedClassStrategy::new(
        [],
        DEFAULT_LARGE_ATTRIBUTE_LENGTH,
        DEFAULT_ATTRIBUTE_LENGTH,
    ))
}

fn capacities(token: &MockToken) -> Vec<Vec<usize>> {
    token
        .queries()
        .iter()
        .map(|query| query.iter().map(|request| request.capacity).collect())
        .collect()
}

fn types_of(token: &MockToken, round: usize) -> Vec<CK_ATTRIBUTE_TYPE> {
    token
        .queries()
        .get(round)
        .map(|query| query.iter().map(|request| request.attribute_type).collect())
        .unwrap_or_default()
}

fn values(attributes: &[FetchedAttribute]) -> Vec<(CK_ATTRIBUTE_TYPE, AttributeValue)> {
    attributes
        .iter()
        .map(|attribute| (attribute.attribute_type, attribute.value.clone()))
        .collect()
}

#[test]
fn small_attribute_fits_the_guess() -> HResult<()> {
    log_init("cosmian_hsm_attributes=trace");
    let token = MockToken::new().with_value(CKA_TOKEN, &[1]);

    let (attributes, rounds) =
        fetch_batch(&token, &AttributeLengthStrategy::default(), &[CKA_TOKEN])?;

    assert_eq!(rounds, 1);
    assert_eq!(capacities(&token), vec![vec![DEFAULT_ATTRIBUTE_LENGTH]]);
    assert_eq!(attributes.len(), 1);
    assert_eq!(attributes[0].attribute_type, CKA_TOKEN);
    assert_eq!(attributes[0].value.as_bytes(), Some(&[1_u8][..]));
    assert_eq!(attributes[0].value.len(), Some(1));
    Ok(())
}

#[test]
fn too_small_guess_queries_the_length() -> HResult<()> {
    log_init("cosmian_hsm_attributes=trace");
    let modulus = vec![0xa5_u8; 300];
    let token = MockToken::new().with_value(CKA_MODULUS, &modulus);

    let (attributes, rounds) = fetch_batch(&token, &small_guesses(), &[CKA_MODULUS])?;

    assert_eq!(rounds, 3);
    assert_eq!(capacities(&token), vec![vec![72], vec![0], vec![300]]);
    assert_eq!(attributes[0].value.as_bytes(), Some(modulus.as_slice()));
    Ok(())
}

#[test]
fn large_guess_fetches_in_one_round() -> HResult<()> {
    let modulus = vec![0xa5_u8; 300];
    let token = MockToken::new().with_value(CKA_MODULUS, &modulus);

    let (attributes, rounds) =
        fetch_batch(&token, &AttributeLengthStrategy::default(), &[CKA_MODULUS])?;

    assert_eq!(rounds, 1);
    assert_eq!(
        capacities(&token),
        vec![vec![DEFAULT_LARGE_ATTRIBUTE_LENGTH]]
    );
    assert_eq!(attributes[0].value.len(), Some(300));
    Ok(())
}

#[test]
fn inapplicable_attribute_without_guess() -> HResult<()> {
    let token = MockToken::new().with_value(CKA_LABEL, b"data");

    let (attributes, rounds) =
        fetch_batch(&token, &AttributeLengthStrategy::NoGuess, &[CKA_MODULUS])?;

    assert_eq!(rounds, 1);
    assert_eq!(capacities(&token), vec![vec![0]]);
    assert_eq!(attributes[0].value, AttributeValue::Unavailable);
    assert!(!attributes[0].value.is_available());
    Ok(())
}

#[test]
fn overloaded_status_is_read_as_too_small() -> HResult<()> {
    log_init("cosmian_hsm_attributes=trace");
    let label = vec![b'l'; 100];
    let id = [7_u8; 16];
    let token = MockToken::new()
        .with_value(CKA_LABEL, &label)
        .with_value(CKA_ID, &id)
        .with_value(CKA_CLASS, &CLASS_BYTES)
        .overloading_too_small();
    let requested = [CKA_MODULUS, CKA_VALUE, CKA_LABEL, CKA_ID, CKA_CLASS];

    let (attributes, rounds) =
        fetch_batch(&token, &AttributeLengthStrategy::default(), &requested)?;

    assert_eq!(rounds, 3);
    // fetched attributes are never asked again
    assert_eq!(types_of(&token, 1), vec![CKA_MODULUS, CKA_VALUE, CKA_LABEL]);
    assert_eq!(capacities(&token)[1], vec![0, 0, 0]);
    assert_eq!(types_of(&token, 2), vec![CKA_LABEL]);
    assert_eq!(capacities(&token)[2], vec![100]);
    assert_eq!(
        values(&attributes),
        vec![
            (CKA_MODULUS, AttributeValue::Unavailable),
            (CKA_VALUE, AttributeValue::Unavailable),
            (CKA_LABEL, AttributeValue::Value(label.into())),
            (CKA_ID, AttributeValue::Value(id.to_vec().into())),
            (CKA_CLASS, AttributeValue::Value(CLASS_BYTES.to_vec().into())),
        ]
    );
    Ok(())
}

#[test]
fn strict_policy_takes_unavailable_at_face_value() -> HResult<()> {
    let token = MockToken::new()
        .with_value(CKA_LABEL, &[b'l'; 100])
        .with_value(CKA_ID, &[7_u8; 16])
        .with_value(CKA_CLASS, &CLASS_BYTES)
        .overloading_too_small();
    let requested = [CKA_MODULUS, CKA_VALUE, CKA_LABEL, CKA_ID, CKA_CLASS];

    let (attributes, rounds) = fetch(
        &token,
        &AttributeLengthStrategy::default(),
        FetchMode::Batch,
        AmbiguityPolicy::Strict,
        &requested,
    )?;

    // the too small label cannot be told apart from the inapplicable attributes
    assert_eq!(rounds, 1);
    assert_eq!(attributes[2].attribute_type, CKA_LABEL);
    assert_eq!(attributes[2].value, AttributeValue::Unavailable);
    assert_eq!(attributes[3].value.len(), Some(16));
    assert_eq!(attributes[4].value.len(), Some(8));
    Ok(())
}

#[test]
fn single_sensitive_attribute_is_final() -> HResult<()> {
    let token = MockToken::new().with_sensitive(CKA_PRIVATE_EXPONENT);

    let (attributes, rounds) = fetch_batch(
        &token,
        &AttributeLengthStrategy::default(),
        &[CKA_PRIVATE_EXPONENT],
    )?;

    assert_eq!(rounds, 1);
    assert_eq!(attributes[0].value, AttributeValue::Unavailable);
    Ok(())
}

#[test]
fn sensitive_pair_with_guess_costs_one_more_round() -> HResult<()> {
    let token = MockToken::new()
        .with_sensitive(CKA_PRIVATE_EXPONENT)
        .with_sensitive(CKA_PRIME_1)
        .with_value(CKA_LABEL, b"key");

    let (attributes, rounds) = fetch_batch(
        &token,
        &AttributeLengthStrategy::default(),
        &[CKA_PRIVATE_EXPONENT, CKA_PRIME_1, CKA_LABEL],
    )?;

    assert_eq!(rounds, 2);
    assert_eq!(types_of(&token, 1), vec![CKA_PRIVATE_EXPONENT, CKA_PRIME_1]);
    assert_eq!(capacities(&token)[1], vec![0, 0]);
    assert_eq!(
        values(&attributes),
        vec![
            (CKA_PRIVATE_EXPONENT, AttributeValue::Unavailable),
            (CKA_PRIME_1, AttributeValue::Unavailable),
            (CKA_LABEL, AttributeValue::Value(b"key".to_vec().into())),
        ]
    );
    Ok(())
}

#[test]
fn single_mode_sends_one_attribute_per_round() -> HResult<()> {
    let token = MockToken::new()
        .with_value(CKA_LABEL, b"label")
        .with_value(CKA_ID, b"id")
        .with_value(CKA_CLASS, &CLASS_BYTES);

    let (attributes, rounds) = fetch(
        &token,
        &AttributeLengthStrategy::NoGuess,
        FetchMode::Single,
        AmbiguityPolicy::default(),
        &[CKA_LABEL, CKA_ID, CKA_CLASS],
    )?;

    assert_eq!(rounds, 6);
    assert_eq!(
        capacities(&token),
        vec![vec![0], vec![5], vec![0], vec![2], vec![0], vec![8]]
    );
    assert_eq!(types_of(&token, 0), vec![CKA_LABEL]);
    assert_eq!(types_of(&token, 2), vec![CKA_ID]);
    assert_eq!(types_of(&token, 4), vec![CKA_CLASS]);
    assert_eq!(attributes[1].value.as_bytes(), Some(&b"id"[..]));
    Ok(())
}

#[test]
fn single_mode_retries_missed_guesses_one_at_a_time() -> HResult<()> {
    let label = vec![b'l'; 100];
    let token = MockToken::new()
        .with_value(CKA_LABEL, &label)
        .with_value(CKA_ID, b"id")
        .with_value(CKA_CLASS, &CLASS_BYTES);
    let requested = [CKA_LABEL, CKA_ID, CKA_CLASS];

    let (attributes, rounds) = fetch(
        &token,
        &AttributeLengthStrategy::default(),
        FetchMode::Single,
        AmbiguityPolicy::default(),
        &requested,
    )?;

    assert_eq!(rounds, 5);
    assert!(rounds <= 2 * requested.len());
    assert_eq!(
        capacities(&token),
        vec![vec![72], vec![0], vec![100], vec![72], vec![72]]
    );
    for round in 0..3 {
        assert_eq!(types_of(&token, round), vec![CKA_LABEL]);
    }
    assert_eq!(types_of(&token, 3), vec![CKA_ID]);
    assert_eq!(types_of(&token, 4), vec![CKA_CLASS]);
    assert_eq!(
        values(&attributes),
        vec![
            (CKA_LABEL, AttributeValue::Value(label.into())),
            (CKA_ID, AttributeValue::Value(b"id".to_vec().into())),
            (CKA_CLASS, AttributeValue::Value(CLASS_BYTES.to_vec().into())),
        ]
    );
    Ok(())
}

#[test]
fn results_follow_request_order() -> HResult<()> {
    let token = MockToken::new()
        .with_value(CKA_LABEL, &[b'l'; 100])
        .with_value(CKA_ID, b"id")
        .with_value(CKA_CLASS, &CLASS_BYTES)
        .reversing_replies();

    let (attributes, rounds) = fetch_batch(
        &token,
        &AttributeLengthStrategy::default(),
        &[CKA_ID, CKA_LABEL, CKA_CLASS],
    )?;

    assert_eq!(rounds, 3);
    let types: Vec<CK_ATTRIBUTE_TYPE> = attributes.iter().map(|a| a.attribute_type).collect();
    assert_eq!(types, vec![CKA_ID, CKA_LABEL, CKA_CLASS]);
    assert_eq!(attributes[0].value.len(), Some(2));
    assert_eq!(attributes[1].value.len(), Some(100));
    assert_eq!(attributes[2].value.len(), Some(8));
    Ok(())
}

#[test]
fn duplicate_request_is_rejected() {
    let token = MockToken::new().with_value(CKA_LABEL, b"label");

    let result = fetch_batch(
        &token,
        &AttributeLengthStrategy::default(),
        &[CKA_LABEL, CKA_ID, CKA_LABEL],
    );

    assert!(matches!(result, Err(HError::DuplicateAttribute(t)) if t == CKA_LABEL));
    assert_eq!(token.rounds(), 0);
}

#[test]
fn empty_request_makes_no_call() -> HResult<()> {
    let token = MockToken::new();

    let (attributes, rounds) = fetch_batch(&token, &AttributeLengthStrategy::default(), &[])?;

    assert!(attributes.is_empty());
    assert_eq!(rounds, 0);
    assert_eq!(token.rounds(), 0);
    Ok(())
}

#[test]
fn empty_attribute_is_fetched() -> HResult<()> {
    let token = MockToken::new()
        .with_value(CKA_LABEL, b"")
        .with_value(CKA_ID, b"");

    let (attributes, rounds) =
        fetch_batch(&token, &AttributeLengthStrategy::NoGuess, &[CKA_LABEL])?;
    assert_eq!(rounds, 1);
    assert_eq!(attributes[0].value.as_bytes(), Some(&[][..]));

    let (attributes, rounds) =
        fetch_batch(&token, &AttributeLengthStrategy::default(), &[CKA_ID])?;
    assert_eq!(rounds, 1);
    assert_eq!(attributes[0].value.len(), Some(0));
    Ok(())
}

#[test]
fn fatal_status_reports_every_outstanding_attribute() {
    let token = MockToken::new()
        .with_value(CKA_LABEL, b"label")
        .failing_on_round(1, CKR_OBJECT_HANDLE_INVALID);

    let result = fetch_batch(
        &token,
        &AttributeLengthStrategy::default(),
        &[CKA_LABEL, CKA_MODULUS],
    );

    match result {
        Err(HError::Pkcs11 { rv, outstanding }) => {
            assert_eq!(rv, CKR_OBJECT_HANDLE_INVALID);
            assert_eq!(outstanding, vec![CKA_LABEL, CKA_MODULUS]);
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
fn fatal_status_after_progress_reports_unresolved_attributes() {
    let token = MockToken::new()
        .with_value(CKA_LABEL, &[b'l'; 100])
        .with_value(CKA_ID, b"id")
        .failing_on_round(2, CKR_OBJECT_HANDLE_INVALID);

    let result = fetch_batch(
        &token,
        &AttributeLengthStrategy::default(),
        &[CKA_LABEL, CKA_ID],
    );

    match result {
        Err(HError::Pkcs11 { rv, outstanding }) => {
            assert_eq!(rv, CKR_OBJECT_HANDLE_INVALID);
            assert_eq!(outstanding, vec![CKA_LABEL]);
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(token.rounds(), 2);
}

#[test]
fn fatal_status_in_single_mode_reports_unqueried_attributes() {
    let token = MockToken::new()
        .with_value(CKA_LABEL, b"label")
        .with_value(CKA_ID, b"id")
        .with_value(CKA_CLASS, &CLASS_BYTES)
        .failing_on_round(1, CKR_OBJECT_HANDLE_INVALID);

    let result = fetch(
        &token,
        &AttributeLengthStrategy::default(),
        FetchMode::Single,
        AmbiguityPolicy::default(),
        &[CKA_LABEL, CKA_ID, CKA_CLASS],
    );

    match result {
        Err(HError::Pkcs11 { rv, outstanding }) => {
            assert_eq!(rv, CKR_OBJECT_HANDLE_INVALID);
            assert_eq!(outstanding, vec![CKA_LABEL, CKA_ID, CKA_CLASS]);
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(types_of(&token, 0), vec![CKA_LABEL]);
}

#[test]
fn fatal_status_in_single_mode_omits_fetched_attributes() {
    let token = MockToken::new()
        .with_value(CKA_LABEL, b"label")
        .with_value(CKA_ID, b"id")
        .with_value(CKA_CLASS, &CLASS_BYTES)
        .failing_on_round(3, CKR_OBJECT_HANDLE_INVALID);

    let result = fetch(
        &token,
        &AttributeLengthStrategy::NoGuess,
        FetchMode::Single,
        AmbiguityPolicy::default(),
        &[CKA_LABEL, CKA_ID, CKA_CLASS],
    );

    match result {
        Err(HError::Pkcs11 { rv, outstanding }) => {
            assert_eq!(rv, CKR_OBJECT_HANDLE_INVALID);
            assert_eq!(outstanding, vec![CKA_ID, CKA_CLASS]);
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(token.rounds(), 3);
}

#[test]
fn instrumented_device_counts_rounds() -> HResult<()> {
    let device = InstrumentedDevice::new(
        MockToken::new().with_value(CKA_MODULUS, &[0xa5_u8; 300]),
    );

    let (attributes, rounds) = fetch_batch(&device, &small_guesses(), &[CKA_MODULUS])?;
    assert_eq!(rounds, 3);
    assert_eq!(attributes[0].value.len(), Some(300));
    assert_eq!(device.inner().rounds(), 3);

    let metrics = device.metrics()?;
    let stats = metrics
        .get("C_GetAttributeValue")
        .ok_or_else(|| HError::Default("no statistics recorded".to_owned()))?;
    assert_eq!(stats.attempts, 3);
    assert_eq!(stats.successes, 2);
    assert_eq!(stats.return_codes.get(&CKR_BUFFER_TOO_SMALL), Some(&1));
    assert_eq!(stats.errors, 0);
    Ok(())
}
