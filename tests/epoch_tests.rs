//! Epoch engine integration tests: identities, string grammars, leap
//! seconds, range search, and unix-time export.

use cdfio::epochs::{
    breakdown_epoch, breakdown_epoch16, breakdown_tt2000, compute_epoch, compute_epoch16,
    compute_tt2000, encode, encode_epoch, encode_epoch16, encode_tt2000, epochrange_epoch,
    parse, to_unixtime, EpochValue, TT2000_FILL, TT2000_PAD,
};
use cdfio::{Epoch16, Error, Values};

#[test]
fn compute_breakdown_identity_across_types() -> Result<(), Error> {
    let epoch_cases = [
        [1990.0, 6.0, 15.0, 12.0, 30.0, 45.0, 500.0],
        [2000.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0],
        [2023.0, 12.0, 31.0, 23.0, 59.0, 59.0, 999.0],
    ];
    for comp in epoch_cases {
        let e = compute_epoch(&comp)?;
        let back = breakdown_epoch(e);
        let round = compute_epoch(&back.map(|c| c as f64))?;
        assert_eq!(round, e, "CDF_EPOCH identity for {comp:?}");
    }

    let epoch16_cases = [
        [2012.0, 7.0, 1.0, 0.0, 0.0, 0.0, 1.0, 2.0, 3.0, 4.0],
        [1980.0, 1.0, 6.0, 6.0, 0.0, 0.0, 0.0, 0.0, 0.0, 999.0],
    ];
    for comp in epoch16_cases {
        let e = compute_epoch16(&comp)?;
        let back = breakdown_epoch16(e);
        let round = compute_epoch16(&back.map(|c| c as f64))?;
        assert_eq!(round, e, "CDF_EPOCH16 identity for {comp:?}");
    }

    let tt2000_cases = [
        [2008.0, 2.0, 2.0, 6.0, 8.0, 10.0, 12.0, 14.0, 16.0],
        [1995.0, 10.0, 10.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0],
        [2020.0, 2.0, 29.0, 23.0, 59.0, 59.0, 999.0, 999.0, 999.0],
    ];
    for comp in tt2000_cases {
        let t = compute_tt2000(&comp)?;
        let back = breakdown_tt2000(t);
        let round = compute_tt2000(&back.map(|c| c as f64))?;
        assert_eq!(round, t, "TT2000 identity for {comp:?}");
    }
    Ok(())
}

#[test]
fn encode_parse_identity_both_grammars() -> Result<(), Error> {
    let e = compute_epoch(&[2004.0, 5.0, 13.0, 15.0, 8.0, 11.0, 22.0])?;
    for iso in [true, false] {
        let s = encode_epoch(e, iso);
        assert_eq!(parse(&s)?, EpochValue::Epoch(e), "grammar iso={iso}");
    }

    let e16 = compute_epoch16(&[2004.0, 5.0, 13.0, 15.0, 8.0, 11.0, 22.0, 33.0, 44.0, 55.0])?;
    for iso in [true, false] {
        let s = encode_epoch16(e16, iso);
        assert_eq!(parse(&s)?, EpochValue::Epoch16(e16), "grammar iso={iso}");
    }

    let t = compute_tt2000(&[2008.0, 2.0, 2.0, 6.0, 8.0, 10.0, 12.0, 14.0, 16.0])?;
    for iso in [true, false] {
        let s = encode_tt2000(t, iso);
        assert_eq!(parse(&s)?, EpochValue::TimeTt2000(t), "grammar iso={iso}");
    }
    Ok(())
}

#[test]
fn leap_second_insertion_is_exact() -> Result<(), Error> {
    // 2016-12-31T23:59:60.500000000 and its breakdown
    let comp = [2016.0, 12.0, 31.0, 23.0, 59.0, 60.0, 500.0, 0.0, 0.0];
    let t = compute_tt2000(&comp)?;
    assert_eq!(breakdown_tt2000(t), [2016, 12, 31, 23, 59, 60, 500, 0, 0]);

    // the nanosecond just before the insertion round-trips
    let before = compute_tt2000(&[2016.0, 12.0, 31.0, 23.0, 59.0, 59.0, 999.0, 999.0, 999.0])?;
    assert_eq!(
        breakdown_tt2000(before),
        [2016, 12, 31, 23, 59, 59, 999, 999, 999]
    );

    // earlier insertions behave identically (2015-06-30)
    let mid = compute_tt2000(&[2015.0, 6.0, 30.0, 23.0, 59.0, 60.0, 0.0, 0.0, 0.0])?;
    assert_eq!(breakdown_tt2000(mid), [2015, 6, 30, 23, 59, 60, 0, 0, 0]);
    Ok(())
}

#[test]
fn fill_and_pad_sentinels_bypass_leap_math() -> Result<(), Error> {
    assert_eq!(
        compute_tt2000(&[9999.0, 12.0, 31.0, 23.0, 59.0, 59.0, 999.0, 999.0, 999.0])?,
        TT2000_FILL
    );
    assert_eq!(compute_tt2000(&[0.0, 1.0, 1.0])?, TT2000_PAD);
    assert_eq!(
        encode_tt2000(TT2000_FILL, true),
        "9999-12-31T23:59:59.999999999"
    );
    assert_eq!(
        parse("0000-01-01T00:00:00.000000000")?,
        EpochValue::TimeTt2000(TT2000_PAD)
    );

    let fill = compute_epoch(&[9999.0, 12.0, 31.0, 23.0, 59.0, 59.0, 999.0])?;
    assert_eq!(fill, -1.0e31);
    assert_eq!(parse("9999-12-31T23:59:59.999")?, EpochValue::Epoch(fill));
    Ok(())
}

#[test]
fn epoch16_picoseconds_carry_into_seconds() -> Result<(), Error> {
    // exactly 10^12 picoseconds is a carry, not an error
    let carried = compute_epoch16(&[2010.0, 1.0, 1.0, 0.0, 0.0, 0.0, 1000.0, 0.0, 0.0, 0.0])?;
    let next_second = compute_epoch16(&[2010.0, 1.0, 1.0, 0.0, 0.0, 1.0])?;
    assert_eq!(carried, next_second);
    assert!(carried.picoseconds >= 0.0 && carried.picoseconds < 1.0e12);
    Ok(())
}

#[test]
fn range_search_boundaries() -> Result<(), Error> {
    // 100 epochs 0.04 ms apart: e75 + 1 ms lies beyond every value
    let base = compute_epoch(&[2017.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0])?;
    let epochs: Vec<f64> = (0..100).map(|i| base + i as f64 * 0.04).collect();

    assert_eq!(
        epochrange_epoch(&epochs, Some(epochs[25]), Some(epochs[75])),
        Some((25, 75))
    );
    assert_eq!(
        epochrange_epoch(&epochs, Some(epochs[75] + 1.0), None),
        None
    );
    assert_eq!(epochrange_epoch(&epochs, None, None), Some((0, 99)));
    Ok(())
}

#[test]
fn unixtime_is_microsecond_precise() -> Result<(), Error> {
    let e = compute_epoch(&[1970.0, 1.0, 2.0, 0.0, 0.0, 0.0, 1.0])?;
    let ut = to_unixtime(&Values::Epoch(vec![e]))?;
    assert!((ut[0] - 86400.001).abs() < 1e-9);

    let e16 = Epoch16::new(
        compute_epoch16(&[1970.0, 1.0, 1.0, 0.0, 0.0, 30.0])?.seconds,
        123_456_789_000.0, // 123456.789 us; truncated to whole us
    );
    let ut = to_unixtime(&Values::Epoch16(vec![e16]))?;
    assert!((ut[0] - 30.123456).abs() < 1e-9);
    Ok(())
}

#[test]
fn generic_encode_dispatches_by_variant() -> Result<(), Error> {
    let t = compute_tt2000(&[2008.0, 2.0, 2.0, 6.0, 8.0, 10.0, 12.0, 14.0, 16.0])?;
    let strings = encode(&Values::TimeTt2000(vec![t]), true)?;
    assert_eq!(strings, vec!["2008-02-02T06:08:10.012014016".to_string()]);
    assert!(encode(&Values::Int2(vec![1]), true).is_err());
    Ok(())
}

#[test]
fn out_of_span_inputs_fail_typed() {
    assert!(matches!(
        compute_tt2000(&[1650.0, 1.0, 1.0]),
        Err(Error::OutOfRange(_))
    ));
    assert!(matches!(
        compute_epoch(&[-5.0, 1.0, 1.0]),
        Err(Error::OutOfRange(_))
    ));
}

#[test]
fn fractional_last_component_cascades() -> Result<(), Error> {
    // 30.25 seconds -> 30 s 250 ms
    let e = compute_epoch(&[2001.0, 3.0, 4.0, 5.0, 6.0, 30.25])?;
    assert_eq!(breakdown_epoch(e), [2001, 3, 4, 5, 6, 30, 250]);

    // 10.5 ms -> 10 ms 500 us on a TT2000
    let t = compute_tt2000(&[2008.0, 2.0, 2.0, 6.0, 8.0, 10.0, 10.5])?;
    assert_eq!(breakdown_tt2000(t), [2008, 2, 2, 6, 8, 10, 10, 500, 0]);
    Ok(())
}
