//! End-to-end wire checks: a value travels DPT-encode → cEMI → KNXnet/IP
//! tunnel framing and comes back out identical, with catalogue-driven
//! decoding on the receive side.

use snapdog_core::catalogue::{parse_ets_csv, Catalogue};
use snapdog_core::knx::cemi::{Apci, CemiFrame, GroupEvent, Payload};
use snapdog_core::knx::dpt::{self, DptId, GroupValue};
use snapdog_core::knx::netip;
use snapdog_core::knx::GroupAddress;

fn ga(s: &str) -> GroupAddress {
    s.parse().unwrap()
}

#[test]
fn temperature_write_through_tunnel_framing() {
    let dpt = DptId::new(9, 1);
    let value = GroupValue::F16(21.5);

    // sender side
    let bytes = dpt::encode(&value, dpt).unwrap();
    let cemi = CemiFrame::group_write(ga("2/0/4"), Payload::for_dpt(bytes, dpt));
    let datagram = netip::tunneling_request(0x15, 3, &cemi.encode()).encode();

    // receiver side
    let frame = netip::Frame::decode(&datagram).unwrap();
    assert_eq!(frame.service, netip::TUNNELING_REQUEST);
    let request = netip::parse_tunneling_request(&frame).unwrap();
    assert_eq!((request.channel, request.seq), (0x15, 3));

    let received = CemiFrame::decode(&request.cemi).unwrap();
    assert_eq!(received.dst, ga("2/0/4"));
    assert_eq!(received.apci, Apci::GroupValueWrite);

    let catalogue = Catalogue::new(parse_ets_csv(
        "Address;Description;DPT\n2/0/4;Kitchen temperature;DPST-9-1\n",
    ));
    let event = GroupEvent::from_frame(&received, catalogue.dpt_for(received.dst));
    assert_eq!(event.value, Some(GroupValue::F16(21.5)));
    assert_eq!(event.dpt, Some(dpt));
    assert_eq!(
        dpt::format_value(event.value.as_ref().unwrap(), event.dpt),
        "21.5°C"
    );
}

#[test]
fn switch_write_through_routing_framing() {
    let cemi = CemiFrame::group_write(ga("1/1/1"), Payload::Small(1));
    let datagram = netip::routing_indication(&cemi.encode()).encode();

    let frame = netip::Frame::decode(&datagram).unwrap();
    assert_eq!(frame.service, netip::ROUTING_INDICATION);
    let received = CemiFrame::decode(&frame.body).unwrap();
    assert_eq!(received.payload, Payload::Small(1));

    // no catalogue: heuristics fill in the switch DPT, display-only
    let event = GroupEvent::from_frame(&received, None);
    assert_eq!(event.dpt, Some(DptId::new(1, 1)));
    assert_eq!(event.value, Some(GroupValue::Bool(true)));
}

#[test]
fn unknown_dpt_survives_losslessly() {
    // three bytes match no supported DPT length
    let cemi = CemiFrame::group_write(ga("4/4/4"), Payload::Bytes(vec![0xDE, 0xAD, 0x42]));
    let received = CemiFrame::decode(&cemi.encode()).unwrap();
    let event = GroupEvent::from_frame(&received, None);
    assert_eq!(event.value, None);
    assert_eq!(event.dpt, None);
    assert_eq!(event.raw, vec![0xDE, 0xAD, 0x42]);
}

#[test]
fn percent_scaling_matches_the_bus_convention() {
    // 75 % must hit the wire as 191 and come back as 75 %
    let bytes = dpt::encode(&GroupValue::U8(75), DptId::new(5, 1)).unwrap();
    assert_eq!(bytes, vec![0xBF]);
    assert_eq!(
        dpt::decode(&bytes, DptId::new(5, 1)).unwrap(),
        GroupValue::U8(75)
    );
}
