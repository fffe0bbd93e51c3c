pub const INDEX_HTML: &str = r#"<!doctype html>
<html>
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width,initial-scale=1">
  <title>ESP32 Wi-Fi Setup</title>
  <style>
    body{font-family:system-ui,Arial,sans-serif;max-width:560px;margin:24px auto;padding:0 12px;color:#222}
    h1{font-size:1.25rem}
    .card{border:1px solid #ddd;border-radius:12px;padding:16px;margin-top:12px}
    input,button{width:100%;box-sizing:border-box;padding:10px;margin:6px 0;border:1px solid #ccc;border-radius:10px}
    button{background:#f4f4f4;cursor:pointer}
    ul{padding-left:16px} li{cursor:pointer;margin:4px 0}
    small{color:#666} pre{white-space:pre-wrap}
  </style>
</head>
<body>
  <h1>ESP32 Wi-Fi Setup</h1>
  <div class="card">
    <form id="form">
      <label for="ssid">SSID</label>
      <input id="ssid" name="ssid" placeholder="Wi-Fi network" required>
      <label for="password">Password</label>
      <input id="password" name="password" type="password" placeholder="Wi-Fi password" required>
      <label for="hostname">Hostname (optional)</label>
      <input id="hostname" name="hostname" placeholder="esp32-node">
      <button type="submit">Save &amp; connect</button>
    </form>
    <div id="msg"></div>
  </div>
  <div class="card">
    <button id="scan" type="button">Scan networks</button>
    <ul id="nets"></ul>
    <small>Tap a network to fill in the SSID.</small>
  </div>
  <div class="card">
    <button id="ota" type="button">Check for update</button>
    <button id="info" type="button">System info</button>
    <pre id="out"></pre>
  </div>
<script>
const $ = (id) => document.getElementById(id);
const show = (el, obj) => { el.textContent = JSON.stringify(obj, null, 2); };

$('scan').onclick = async () => {
  const nets = $('nets');
  nets.innerHTML = '<li>Scanning...</li>';
  try {
    const list = await (await fetch('/scan')).json();
    nets.innerHTML = '';
    list.forEach((n) => {
      const li = document.createElement('li');
      li.textContent = `${n.ssid || '(hidden)'}  (RSSI ${n.rssi})${n.secure ? ' [secured]' : ''}`;
      li.onclick = () => { $('ssid').value = n.ssid; };
      nets.appendChild(li);
    });
    if (!list.length) nets.innerHTML = '<li>No networks found</li>';
  } catch (e) {
    nets.innerHTML = '<li>Scan error</li>';
  }
};

$('form').onsubmit = async (ev) => {
  ev.preventDefault();
  $('msg').textContent = 'Connecting...';
  const body = new URLSearchParams(new FormData($('form'))).toString();
  const r = await fetch('/save', {
    method: 'POST',
    headers: {'Content-Type': 'application/x-www-form-urlencoded'},
    body,
  });
  show($('msg'), await r.json());
};

$('ota').onclick = async () => {
  const r = await fetch('/ota/check', {method: 'POST'});
  show($('out'), await r.json());
};

$('info').onclick = async () => {
  const r = await fetch('/sysinfo');
  show($('out'), r.ok ? await r.json() : {error: r.status});
};
</script>
</body>
</html>
"#;
